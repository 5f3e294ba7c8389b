//! Query builder for flexible configuration
//!
//! Collects criteria and tuning options before the query subscribes to
//! anything.

use crate::config::QueryConfig;
use crate::error::Result;
use crate::query::GeoQuery;
use crate::storage::GeoStore;
use crate::types::{Location, QueryCriteria};
use std::sync::Arc;
use std::time::Duration;

/// Builder for a [`GeoQuery`].
///
/// ```rust
/// use geowatch::{GeoQuery, Location};
/// use geowatch::storage::MemoryStore;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let query = GeoQuery::builder(Arc::new(MemoryStore::new()))
///     .center(Location::new(37.7749, -122.4194))
///     .radius(5.0)
///     .cleanup_threshold(50)
///     .sweep_interval(Duration::ZERO)
///     .build()?;
/// assert_eq!(query.radius(), 5.0);
/// # Ok::<(), geowatch::GeoError>(())
/// ```
pub struct QueryBuilder {
    store: Arc<dyn GeoStore>,
    criteria: QueryCriteria,
    config: QueryConfig,
}

impl QueryBuilder {
    pub fn new(store: Arc<dyn GeoStore>) -> Self {
        Self {
            store,
            criteria: QueryCriteria::default(),
            config: QueryConfig::default(),
        }
    }

    pub fn center(mut self, center: impl Into<Location>) -> Self {
        self.criteria.center = Some(center.into());
        self
    }

    /// Radius in kilometers.
    pub fn radius(mut self, radius: f64) -> Self {
        self.criteria.radius = Some(radius);
        self
    }

    /// Replace both center and radius.
    pub fn criteria(mut self, criteria: QueryCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn precision(mut self, precision: usize) -> Self {
        self.config = self.config.with_precision(precision);
        self
    }

    pub fn cleanup_threshold(mut self, threshold: usize) -> Self {
        self.config = self.config.with_cleanup_threshold(threshold);
        self
    }

    pub fn cleanup_delay(mut self, delay: Duration) -> Self {
        self.config = self.config.with_cleanup_delay(delay);
        self
    }

    /// Period of background sweeps. `Duration::ZERO` disables them.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_sweep_interval(interval);
        self
    }

    /// Validate everything and start the query.
    pub fn build(self) -> Result<GeoQuery> {
        GeoQuery::with_config(self.store, self.criteria, self.config)
    }
}
