//! Keyed location CRUD on top of a [`GeoStore`].

use crate::compute::validation::{validate_key, validate_location};
use crate::config::QueryConfig;
use crate::error::{GeoError, Result};
use crate::query::GeoQuery;
use crate::storage::{GeoStore, decode_record, encode_record};
use crate::types::{Location, QueryCriteria};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Stores locations under string keys and opens live queries over them.
///
/// Every write stores the location together with its geohash, which is what
/// [`GeoQuery`] ranges are matched against.
///
/// ```rust
/// use geowatch::{Location, LocationStore};
/// use geowatch::storage::MemoryStore;
/// use std::sync::Arc;
///
/// # fn main() -> geowatch::Result<()> {
/// let locations = LocationStore::new(Arc::new(MemoryStore::new()));
/// locations.set("loc1", Location::new(0.0, 0.0))?;
/// assert_eq!(locations.get("loc1")?, Some(Location::new(0.0, 0.0)));
///
/// locations.remove("loc1")?;
/// assert_eq!(locations.get("loc1")?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocationStore {
    store: Arc<dyn GeoStore>,
    config: QueryConfig,
}

impl LocationStore {
    pub fn new(store: Arc<dyn GeoStore>) -> Self {
        Self {
            store,
            config: QueryConfig::default(),
        }
    }

    /// Uses `config` for written records and for every query opened here.
    pub fn with_config(store: Arc<dyn GeoStore>, config: QueryConfig) -> Result<Self> {
        config.validate().map_err(GeoError::Config)?;
        Ok(Self { store, config })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn GeoStore> {
        &self.store
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Writes or overwrites the location of `key`.
    pub fn set(&self, key: &str, location: impl Into<Location>) -> Result<()> {
        self.set_many([(key, Some(location.into()))])
    }

    /// Writes several keys in one atomic update. `None` removes the key.
    ///
    /// Every key and location is validated before anything is written.
    pub fn set_many<I, K>(&self, locations: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Option<Location>)>,
        K: Into<String>,
    {
        let mut updates = BTreeMap::new();
        for (key, location) in locations {
            let key = key.into();
            validate_key(&key, self.config.precision)?;
            let record = match location {
                Some(location) => {
                    validate_location(&location)?;
                    Some(encode_record(&location, self.config.precision)?)
                }
                None => None,
            };
            updates.insert(key, record);
        }

        if updates.is_empty() {
            return Ok(());
        }
        log::trace!("writing {} location(s)", updates.len());
        self.store.write_many(updates)?;
        Ok(())
    }

    /// Current location of `key`, or `None` if it is not stored.
    pub fn get(&self, key: &str) -> Result<Option<Location>> {
        validate_key(key, self.config.precision)?;
        self.store
            .read(key)?
            .map(|value| decode_record(key, &value))
            .transpose()
    }

    /// Removes `key`. Removing a missing key succeeds.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.set_many([(key, None)])
    }

    /// Opens a live query with this store's configuration.
    pub fn query(&self, criteria: QueryCriteria) -> Result<GeoQuery> {
        GeoQuery::with_config(self.store.clone(), criteria, self.config.clone())
    }
}

impl fmt::Debug for LocationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
