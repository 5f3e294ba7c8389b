//! Validation for locations, keys, geohashes and query criteria.
//!
//! Every check here runs before any encoding or store access and fails
//! synchronously with a validation error.

use crate::compute::geohash::{BASE32, MAX_PRECISION};
use crate::error::{GeoError, Result};
use crate::types::{Location, QueryCriteria};

/// Longest child path the store accepts.
const MAX_STORE_PATH: usize = 755;

/// Validates that a location has finite coordinates within range.
///
/// Latitude: [-90.0, 90.0], Longitude: [-180.0, 180.0], both inclusive.
///
/// # Examples
///
/// ```
/// use geowatch::Location;
/// use geowatch::compute::validation::validate_location;
///
/// assert!(validate_location(&Location::new(-90.0, 180.0)).is_ok());
/// assert!(validate_location(&Location::new(91.0, 0.0)).is_err());
/// assert!(validate_location(&Location::new(0.0, f64::NAN)).is_err());
/// ```
pub fn validate_location(location: &Location) -> Result<()> {
    let reason = if !location.latitude.is_finite() {
        "latitude must be a number"
    } else if !(-90.0..=90.0).contains(&location.latitude) {
        "latitude must be within the range [-90, 90]"
    } else if !location.longitude.is_finite() {
        "longitude must be a number"
    } else if !(-180.0..=180.0).contains(&location.longitude) {
        "longitude must be within the range [-180, 180]"
    } else {
        return Ok(());
    };

    Err(GeoError::InvalidLocation {
        location: location.to_string(),
        reason: reason.to_string(),
    })
}

/// Validates an entity key against the store's path syntax.
///
/// The stored child path is at least `i/<geohash><key>`, so the key length is
/// bounded by the index precision in use.
pub fn validate_key(key: &str, precision: usize) -> Result<()> {
    let reason = if key.is_empty() {
        "key cannot be the empty string"
    } else if 1 + precision + key.chars().count() > MAX_STORE_PATH {
        "key is too long to be stored"
    } else if key
        .chars()
        .any(|c| matches!(c, '.' | '#' | '$' | '[' | ']' | '/') || c.is_ascii_control())
    {
        "key cannot contain any of the following characters: . # $ ] [ /"
    } else {
        return Ok(());
    };

    Err(GeoError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    })
}

/// Validates that a string is a non-empty geohash over the base-32 alphabet.
pub fn validate_geohash(geohash: &str) -> Result<()> {
    if geohash.is_empty() {
        return Err(GeoError::InvalidGeohash {
            geohash: String::new(),
            reason: "geohash cannot be the empty string".into(),
        });
    }

    if let Some(c) = geohash.chars().find(|c| !BASE32.contains(*c)) {
        return Err(GeoError::InvalidGeohash {
            geohash: geohash.to_string(),
            reason: format!("geohash cannot contain \"{}\"", c),
        });
    }

    Ok(())
}

pub fn validate_precision(precision: usize) -> Result<()> {
    if (1..=MAX_PRECISION).contains(&precision) {
        Ok(())
    } else {
        Err(GeoError::InvalidPrecision(precision))
    }
}

/// Validates query criteria.
///
/// A new query needs both a center and a radius; an update needs at least one.
pub fn validate_criteria(criteria: &QueryCriteria, require_center_and_radius: bool) -> Result<()> {
    match (&criteria.center, &criteria.radius) {
        (None, None) => {
            return Err(GeoError::InvalidCriteria(
                "radius and/or center must be specified".into(),
            ));
        }
        (None, _) | (_, None) if require_center_and_radius => {
            return Err(GeoError::InvalidCriteria(
                "query criteria for a new query must contain both a center and a radius".into(),
            ));
        }
        _ => {}
    }

    if let Some(center) = &criteria.center {
        validate_location(center)?;
    }

    if let Some(radius) = criteria.radius {
        if radius.is_nan() {
            return Err(GeoError::InvalidCriteria("radius must be a number".into()));
        }
        if radius < 0.0 {
            return Err(GeoError::InvalidCriteria(
                "radius must be greater than or equal to 0".into(),
            ));
        }
    }

    Ok(())
}
