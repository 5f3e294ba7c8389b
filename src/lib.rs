//! Geohash-indexed location store with live radius queries.
//!
//! ```rust
//! use geowatch::{Location, LocationStore, QueryCriteria, QueryEventKind};
//! use geowatch::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! let locations = LocationStore::new(Arc::new(MemoryStore::new()));
//! locations.set("fish0", Location::new(0.5, 0.5))?;
//!
//! let query = locations.query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))?;
//! query.on(QueryEventKind::KeyExited, |event| println!("{:?} left", event.key()));
//! locations.remove("fish0")?;
//! # Ok::<(), geowatch::GeoError>(())
//! ```

pub mod builder;
pub mod compute;
pub mod config;
pub mod error;
pub mod locations;
pub mod query;
pub mod storage;
pub mod types;

pub use builder::QueryBuilder;
pub use config::QueryConfig;
pub use error::{GeoError, Result, StoreError, StoreResult};
pub use locations::LocationStore;
pub use query::{CallbackRegistration, GeoQuery};

pub use compute::geohash::{DEFAULT_PRECISION, MAX_PRECISION};
pub use compute::{decode_bounds, distance, encode, plan_coverage};

pub use types::{
    KeyEvent, Location, QueryCriteria, QueryEvent, QueryEventKind, QueryStats, RangeQuery,
    SweepStats,
};

pub use storage::{GeoStore, MemoryStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{GeoError, GeoQuery, LocationStore, QueryBuilder, Result};

    pub use crate::{Location, QueryCriteria, QueryEvent, QueryEventKind};

    pub use crate::{GeoStore, MemoryStore};

    pub use crate::{QueryConfig, distance, encode};

    pub use std::time::Duration;
}
