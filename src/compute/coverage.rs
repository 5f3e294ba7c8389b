//! Coverage planning: the set of index range scans that contains a circle.
//!
//! The circle is sampled at its center plus the corners and edge midpoints of
//! its latitude/longitude bounding box. Each sample's geohash is truncated to a
//! bit depth whose cells are at least as large as the radius, which guarantees
//! that every point inside the circle shares a truncated prefix with one of the
//! samples. Points fetched by these ranges but outside the circle are filtered
//! later with an exact distance check.

use crate::compute::geohash::{BASE32, BITS_PER_CHAR, MAX_BITS_PRECISION, encode, symbol_value};
use crate::compute::validation::{validate_geohash, validate_location};
use crate::error::{GeoError, Result};
use crate::types::{Location, RangeQuery};
use smallvec::SmallVec;

/// Meridional circumference of the Earth, in meters.
pub const EARTH_MERIDIONAL_CIRCUMFERENCE: f64 = 40_007_860.0;

/// Approximate length of one degree of latitude, in meters.
pub const METERS_PER_DEGREE_LATITUDE: f64 = 110_574.0;

/// Equatorial radius of the Earth, in meters.
pub const EARTH_EQUATORIAL_RADIUS: f64 = 6_378_137.0;

/// Squared eccentricity of the WGS84 ellipsoid.
pub const EARTH_E2: f64 = 0.00669447819799;

const EPSILON: f64 = 1e-12;

/// Exclusive end used when a range runs past the last alphabet symbol.
pub const RANGE_END_SENTINEL: char = '~';

/// Ranges covering one circle. Never more than nine.
pub type CoveragePlan = SmallVec<[RangeQuery; 9]>;

/// Degrees of longitude spanned by `distance` meters at `latitude`.
pub fn meters_to_longitude_degrees(distance: f64, latitude: f64) -> f64 {
    let radians = latitude.to_radians();
    let num = radians.cos() * EARTH_EQUATORIAL_RADIUS * std::f64::consts::PI / 180.0;
    let denom = 1.0 / (1.0 - EARTH_E2 * radians.sin() * radians.sin()).sqrt();
    let delta_deg = num * denom;
    if delta_deg < EPSILON {
        if distance > 0.0 { 360.0 } else { 0.0 }
    } else {
        (distance / delta_deg).min(360.0)
    }
}

fn longitude_bits_for_resolution(resolution: f64, latitude: f64) -> f64 {
    let degrees = meters_to_longitude_degrees(resolution, latitude);
    if degrees.abs() > 0.000001 {
        (360.0 / degrees).log2().max(1.0)
    } else {
        1.0
    }
}

fn latitude_bits_for_resolution(resolution: f64) -> f64 {
    (EARTH_MERIDIONAL_CIRCUMFERENCE / 2.0 / resolution)
        .log2()
        .min(MAX_BITS_PRECISION as f64)
}

/// Wraps a longitude into [-180, 180].
pub fn wrap_longitude(longitude: f64) -> f64 {
    if (-180.0..=180.0).contains(&longitude) {
        return longitude;
    }
    let adjusted = longitude + 180.0;
    if adjusted > 0.0 {
        (adjusted % 360.0) - 180.0
    } else {
        180.0 - (-adjusted % 360.0)
    }
}

/// Number of geohash bits whose cells are no smaller than `size` meters in
/// either direction around `center`. Always at least 1.
///
/// Longitude is evaluated at the north and south edges of the box since cells
/// narrow towards the poles. Latitude bits are doubled and longitude bits are
/// doubled minus one so the budget splits evenly between the interleaved axes.
pub fn bounding_box_bits(center: &Location, size: f64) -> usize {
    let lat_delta_degrees = size / METERS_PER_DEGREE_LATITUDE;
    let latitude_north = (center.latitude + lat_delta_degrees).min(90.0);
    let latitude_south = (center.latitude - lat_delta_degrees).max(-90.0);

    let bits_lat = latitude_bits_for_resolution(size).floor() * 2.0;
    let bits_long_north = longitude_bits_for_resolution(size, latitude_north).floor() * 2.0 - 1.0;
    let bits_long_south = longitude_bits_for_resolution(size, latitude_south).floor() * 2.0 - 1.0;

    let bits = bits_lat
        .min(bits_long_north)
        .min(bits_long_south)
        .min(MAX_BITS_PRECISION as f64);

    if bits.is_nan() || bits < 1.0 {
        1
    } else {
        bits as usize
    }
}

/// The nine sample points of a circle: the center, then the box's west and
/// east midpoints, then the north edge and the south edge (middle, west, east).
///
/// When the box reaches a pole or is at least half the globe wide it spans
/// every meridian. [`bounding_box_bits`] is then a single bit, and the west and
/// east samples are pinned to -90 and 90 so both longitude halves are taken.
pub fn bounding_box_coordinates(center: &Location, radius: f64) -> [Location; 9] {
    let lat_degrees = radius / METERS_PER_DEGREE_LATITUDE;
    let latitude_north = (center.latitude + lat_degrees).min(90.0);
    let latitude_south = (center.latitude - lat_degrees).max(-90.0);
    let long_degs = meters_to_longitude_degrees(radius, latitude_north)
        .max(meters_to_longitude_degrees(radius, latitude_south));

    let spans_all_meridians =
        latitude_north >= 90.0 || latitude_south <= -90.0 || long_degs >= 180.0;
    let (west, east) = if spans_all_meridians {
        (-90.0, 90.0)
    } else {
        (
            wrap_longitude(center.longitude - long_degs),
            wrap_longitude(center.longitude + long_degs),
        )
    };

    [
        Location::new(center.latitude, center.longitude),
        Location::new(center.latitude, west),
        Location::new(center.latitude, east),
        Location::new(latitude_north, center.longitude),
        Location::new(latitude_north, west),
        Location::new(latitude_north, east),
        Location::new(latitude_south, center.longitude),
        Location::new(latitude_south, west),
        Location::new(latitude_south, east),
    ]
}

/// The `[start, end)` range of every geohash sharing the first `bits` bits of
/// `geohash`.
///
/// # Examples
///
/// ```
/// use geowatch::compute::coverage::geohash_query;
///
/// let range = geohash_query("7zzzzzzzzz", 3).unwrap();
/// assert_eq!((range.start.as_str(), range.end.as_str()), ("4", "8"));
///
/// let range = geohash_query("zzzzzzzzzz", 5).unwrap();
/// assert_eq!((range.start.as_str(), range.end.as_str()), ("z", "~"));
/// ```
pub fn geohash_query(geohash: &str, bits: usize) -> Result<RangeQuery> {
    validate_geohash(geohash)?;
    if !(1..=MAX_BITS_PRECISION).contains(&bits) {
        return Err(GeoError::InvalidGeohash {
            geohash: geohash.to_string(),
            reason: format!("bit precision must be within [1, {}]", MAX_BITS_PRECISION),
        });
    }

    let precision = bits.div_ceil(BITS_PER_CHAR);
    if geohash.len() < precision {
        return Ok(RangeQuery::new(
            geohash,
            format!("{}{}", geohash, RANGE_END_SENTINEL),
        ));
    }

    // the alphabet is ASCII, so byte slicing is safe after validation
    let truncated = &geohash[..precision];
    let base = &truncated[..precision - 1];
    let last_value = truncated
        .chars()
        .last()
        .and_then(symbol_value)
        .ok_or_else(|| GeoError::Internal(format!("empty geohash prefix for '{}'", geohash)))?;

    let significant_bits = bits - base.len() * BITS_PER_CHAR;
    let unused_bits = BITS_PER_CHAR - significant_bits;

    let start_value = (last_value >> unused_bits) << unused_bits;
    let end_value = start_value + (1 << unused_bits);

    let alphabet = BASE32.as_bytes();
    let start = format!("{}{}", base, alphabet[start_value] as char);
    let end = if end_value >= alphabet.len() {
        format!("{}{}", base, RANGE_END_SENTINEL)
    } else {
        format!("{}{}", base, alphabet[end_value] as char)
    };

    Ok(RangeQuery::new(start, end))
}

/// Plans the range scans covering the circle around `center` with
/// `radius_meters`. The result holds no duplicate ranges and keeps the order
/// of the samples that produced them.
///
/// # Examples
///
/// ```
/// use geowatch::{Location, compute::coverage::plan_coverage};
///
/// let plan = plan_coverage(&Location::new(37.7853, -122.4056), 1_000.0).unwrap();
/// assert!(!plan.is_empty() && plan.len() <= 9);
/// ```
pub fn plan_coverage(center: &Location, radius_meters: f64) -> Result<CoveragePlan> {
    validate_location(center)?;
    if radius_meters.is_nan() || radius_meters < 0.0 {
        return Err(GeoError::InvalidCriteria(
            "radius must be greater than or equal to 0".into(),
        ));
    }

    let query_bits = bounding_box_bits(center, radius_meters);
    let precision = query_bits.div_ceil(BITS_PER_CHAR);

    let mut plan = CoveragePlan::new();
    for coordinate in bounding_box_coordinates(center, radius_meters) {
        let range = geohash_query(&encode(&coordinate, precision)?, query_bits)?;
        if !plan.contains(&range) {
            plan.push(range);
        }
    }

    Ok(plan)
}
