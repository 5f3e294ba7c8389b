//! Error types for geowatch.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GeoError>;

/// Result alias for [`GeoStore`](crate::storage::GeoStore) implementations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by the crate.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("Invalid geohash '{geohash}': {reason}")]
    InvalidGeohash { geohash: String, reason: String },

    #[error("Invalid precision {0}: must be an integer within [1, 22]")]
    InvalidPrecision(usize),

    #[error("Invalid query criteria: {0}")]
    InvalidCriteria(String),

    #[error("Unknown event type '{0}': expected ready, key_entered, key_exited or key_moved")]
    UnknownEventType(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A stored record lacks a usable location. Points at index corruption.
    #[error("Unexpected location record for '{key}': {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error("Internal state error: {0}")]
    Internal(String),

    #[error("Query has been cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GeoError {
    /// True for errors caused by bad caller input. These are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GeoError::InvalidKey { .. }
                | GeoError::InvalidLocation { .. }
                | GeoError::InvalidGeohash { .. }
                | GeoError::InvalidPrecision(_)
                | GeoError::InvalidCriteria(_)
                | GeoError::UnknownEventType(_)
                | GeoError::Config(_)
        )
    }

    /// True for errors that indicate a logic defect or corrupt data.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            GeoError::Internal(_) | GeoError::MalformedRecord { .. }
        )
    }
}

/// Failures reported by the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("range subscription failed: {0}")]
    Subscribe(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("store is closed")]
    Closed,
}
