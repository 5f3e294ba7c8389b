//! Tuning parameters for live queries.
use crate::compute::geohash::{DEFAULT_PRECISION, MAX_PRECISION};
use serde::de::Error;
use std::time::Duration;

/// Query engine configuration.
///
/// ```rust
/// use geowatch::QueryConfig;
///
/// let config = QueryConfig::from_json(r#"{ "cleanup_threshold": 50 }"#).unwrap();
/// assert_eq!(config.cleanup_threshold, 50);
/// assert_eq!(config.precision, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// Length of the index strings written to the store. Keys are checked
    /// against it as well, since the index counts towards the path limit.
    #[serde(default = "QueryConfig::default_precision")]
    pub precision: usize,

    /// Number of range subscriptions above which a deferred sweep is scheduled.
    #[serde(default = "QueryConfig::default_cleanup_threshold")]
    pub cleanup_threshold: usize,

    #[serde(default = "QueryConfig::default_cleanup_delay_ms")]
    pub cleanup_delay_ms: u64,

    /// Period of the background sweep. Zero disables periodic sweeps.
    #[serde(default = "QueryConfig::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl QueryConfig {
    const fn default_precision() -> usize {
        DEFAULT_PRECISION
    }

    const fn default_cleanup_threshold() -> usize {
        25
    }

    const fn default_cleanup_delay_ms() -> u64 {
        10
    }

    const fn default_sweep_interval_ms() -> u64 {
        10_000
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_cleanup_threshold(mut self, threshold: usize) -> Self {
        self.cleanup_threshold = threshold;
        self
    }

    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        if interval > Duration::ZERO && interval < Duration::from_millis(100) {
            log::warn!(
                "Sweep interval of {:?} is very short; every sweep locks the query state",
                interval
            );
        }
        self.sweep_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    /// `None` when the periodic sweep is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_PRECISION).contains(&self.precision) {
            return Err(format!(
                "Precision must be within [1, {}], got {}",
                MAX_PRECISION, self.precision
            ));
        }

        if self.cleanup_threshold == 0 {
            return Err("Cleanup threshold must be greater than zero".to_string());
        }

        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: QueryConfig = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        let config: QueryConfig = toml::from_str(toml_str)?;
        if let Err(e) = config.validate() {
            return Err(toml::de::Error::custom(e));
        }
        Ok(config)
    }

    #[cfg(feature = "toml")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            precision: Self::default_precision(),
            cleanup_threshold: Self::default_cleanup_threshold(),
            cleanup_delay_ms: Self::default_cleanup_delay_ms(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
        }
    }
}
