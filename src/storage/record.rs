//! Wire shape of a stored location record.
//!
//! ```text
//! { ".priority": "<geohash>", "g": "<geohash>", "l": [latitude, longitude] }
//! ```
//!
//! The geohash is written twice: as the store's native sort key and as an
//! explicit field that range subscriptions match on.

use crate::compute::geohash::encode;
use crate::compute::validation::validate_location;
use crate::error::{GeoError, Result};
use crate::types::Location;
use serde_json::{Value, json};

/// Native sort key of the store.
pub const PRIORITY_FIELD: &str = ".priority";

/// Field that range subscriptions are ordered by.
pub const INDEX_FIELD: &str = "g";

/// Field holding the raw `[latitude, longitude]` pair.
pub const LOCATION_FIELD: &str = "l";

/// Builds the record stored for `location`.
///
/// # Examples
///
/// ```
/// use geowatch::Location;
/// use geowatch::storage::encode_record;
///
/// let record = encode_record(&Location::new(0.0, 0.0), 10).unwrap();
/// assert_eq!(record["g"], "7zzzzzzzzz");
/// assert_eq!(record[".priority"], "7zzzzzzzzz");
/// ```
pub fn encode_record(location: &Location, precision: usize) -> Result<Value> {
    let geohash = encode(location, precision)?;
    Ok(json!({
        PRIORITY_FIELD: geohash,
        INDEX_FIELD: geohash,
        LOCATION_FIELD: [location.latitude, location.longitude],
    }))
}

/// Extracts the location from a stored record.
///
/// A record without a valid `l` pair means the index is corrupt, so this
/// fails rather than skipping it.
pub fn decode_record(key: &str, value: &Value) -> Result<Location> {
    let malformed = |reason: &str| GeoError::MalformedRecord {
        key: key.to_string(),
        reason: format!("{} in {}", reason, value),
    };

    let pair = value
        .get(LOCATION_FIELD)
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing location array"))?;

    let location = match pair.as_slice() {
        [lat, lon] => match (lat.as_f64(), lon.as_f64()) {
            (Some(lat), Some(lon)) => Location::new(lat, lon),
            _ => return Err(malformed("non-numeric coordinates")),
        },
        _ => return Err(malformed("expected a [latitude, longitude] pair")),
    };

    validate_location(&location).map_err(|e| malformed(&e.to_string()))?;
    Ok(location)
}
