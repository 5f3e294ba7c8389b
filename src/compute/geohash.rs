//! Geohash encoding and great-circle distance.
//!
//! Encoding interleaves longitude (even bits) and latitude (odd bits), most
//! significant bit first, and packs every five bits into one base-32 symbol.
//! A bit is set when the coordinate is strictly greater than the midpoint of
//! its current range, so points on a cell edge fall into the lower cell.

use crate::compute::validation::{validate_geohash, validate_location, validate_precision};
use crate::error::{GeoError, Result};
use crate::types::Location;

/// Geohash alphabet.
pub const BASE32: &str = "0123456789bcdefghjkmnpqrstuvwxyz";

pub const BITS_PER_CHAR: usize = 5;

/// Precision used when none is given.
pub const DEFAULT_PRECISION: usize = 10;

pub const MAX_PRECISION: usize = 22;

pub const MAX_BITS_PRECISION: usize = MAX_PRECISION * BITS_PER_CHAR;

/// Earth radius used by [`distance`], in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Encodes a location into a geohash of `precision` characters.
///
/// # Examples
///
/// ```
/// use geowatch::{Location, compute::geohash::encode};
///
/// assert_eq!(encode(&Location::new(0.0, 0.0), 10).unwrap(), "7zzzzzzzzz");
/// assert_eq!(encode(&Location::new(50.0, 50.0), 10).unwrap(), "v0gs3y0zh7");
/// assert!(encode(&Location::new(0.0, 0.0), 23).is_err());
/// ```
pub fn encode(location: &Location, precision: usize) -> Result<String> {
    validate_location(location)?;
    validate_precision(precision)?;

    let alphabet = BASE32.as_bytes();
    let mut latitude_range = (-90.0_f64, 90.0_f64);
    let mut longitude_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut hash_value = 0usize;
    let mut bits = 0;
    let mut even = true;

    while hash.len() < precision {
        let (value, range) = if even {
            (location.longitude, &mut longitude_range)
        } else {
            (location.latitude, &mut latitude_range)
        };
        let mid = (range.0 + range.1) / 2.0;

        if value > mid {
            hash_value = (hash_value << 1) + 1;
            range.0 = mid;
        } else {
            hash_value <<= 1;
            range.1 = mid;
        }

        even = !even;
        if bits < BITS_PER_CHAR - 1 {
            bits += 1;
        } else {
            bits = 0;
            hash.push(alphabet[hash_value] as char);
            hash_value = 0;
        }
    }

    Ok(hash)
}

/// Value of a single geohash symbol, `None` if it is outside the alphabet.
pub fn symbol_value(symbol: char) -> Option<usize> {
    BASE32.find(symbol)
}

/// Bounds of the cell a geohash names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellBounds {
    pub south_west: Location,
    pub north_east: Location,
}

impl CellBounds {
    /// Inclusive on every edge.
    pub fn contains(&self, location: &Location) -> bool {
        (self.south_west.latitude..=self.north_east.latitude).contains(&location.latitude)
            && (self.south_west.longitude..=self.north_east.longitude)
                .contains(&location.longitude)
    }
}

/// Decodes a geohash into the bounds of its cell.
///
/// Stored records carry their raw location, so this is never needed to
/// recover a position; it is used for diagnostics and coverage checks.
pub fn decode_bounds(geohash: &str) -> Result<CellBounds> {
    validate_geohash(geohash)?;
    let rect = geohash::decode_bbox(geohash).map_err(|e| GeoError::InvalidGeohash {
        geohash: geohash.to_string(),
        reason: e.to_string(),
    })?;

    Ok(CellBounds {
        south_west: Location::new(rect.min().y, rect.min().x),
        north_east: Location::new(rect.max().y, rect.max().x),
    })
}

/// Great-circle distance between two locations in kilometers (haversine).
///
/// # Examples
///
/// ```
/// use geowatch::{Location, compute::geohash::distance};
///
/// let d = distance(&Location::new(0.0, 0.0), &Location::new(0.0, 1.0)).unwrap();
/// assert!((d - 111.19).abs() < 0.01);
/// ```
pub fn distance(a: &Location, b: &Location) -> Result<f64> {
    validate_location(a)?;
    validate_location(b)?;
    Ok(haversine_km(a, b))
}

/// Haversine distance for already validated locations.
pub(crate) fn haversine_km(a: &Location, b: &Location) -> f64 {
    let lat_delta = (b.latitude - a.latitude).to_radians();
    let lon_delta = (b.longitude - a.longitude).to_radians();

    let h = (lat_delta / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos()
            * b.latitude.to_radians().cos()
            * (lon_delta / 2.0).sin().powi(2);
    // rounding can push h just past 1 for antipodal points
    let h = h.clamp(0.0, 1.0);

    EARTH_RADIUS_KM * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}
