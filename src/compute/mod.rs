//! Pure computation: geohash encoding, distance and coverage planning.
//!
//! Nothing in this layer holds state or touches the store.

pub mod coverage;
pub mod geohash;
pub mod validation;

pub use coverage::{CoveragePlan, plan_coverage};
pub use geohash::{decode_bounds, distance, encode};
