//! Core value types shared by the codec, the planner and the query engine.
use crate::error::{GeoError, Result};
use geo::Point;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A geographic location.
///
/// Serialized as a `[latitude, longitude]` pair, which is also the shape of
/// the `l` field in stored records.
///
/// # Examples
///
/// ```
/// use geowatch::Location;
///
/// let fish = Location::new(-40.0, 159.0);
/// let json = serde_json::to_string(&fish).unwrap();
/// assert_eq!(json, "[-40.0,159.0]");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
}

impl From<[f64; 2]> for Location {
    fn from([latitude, longitude]: [f64; 2]) -> Self {
        Self::new(latitude, longitude)
    }
}

impl From<Location> for [f64; 2] {
    fn from(location: Location) -> Self {
        [location.latitude, location.longitude]
    }
}

impl From<(f64, f64)> for Location {
    fn from((latitude, longitude): (f64, f64)) -> Self {
        Self::new(latitude, longitude)
    }
}

/// `geo` points are (x = longitude, y = latitude).
impl From<Point> for Location {
    fn from(point: Point) -> Self {
        Self::new(point.y(), point.x())
    }
}

impl From<Location> for Point {
    fn from(location: Location) -> Self {
        Point::new(location.longitude, location.latitude)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.latitude, self.longitude)
    }
}

/// Center and radius of a circular query. Radius is in kilometers.
///
/// Both fields are required when a query is created. On update an omitted
/// field keeps its current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
}

impl QueryCriteria {
    pub fn new(center: Location, radius: f64) -> Self {
        Self {
            center: Some(center),
            radius: Some(radius),
        }
    }

    pub fn center(center: Location) -> Self {
        Self {
            center: Some(center),
            radius: None,
        }
    }

    pub fn radius(radius: f64) -> Self {
        Self {
            center: None,
            radius: Some(radius),
        }
    }

    /// Parses criteria from JSON, rejecting unknown attributes.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GeoError::InvalidCriteria(e.to_string()))
    }
}

/// A half-open `[start, end)` scan over index strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RangeQuery {
    pub start: String,
    pub end: String,
}

impl RangeQuery {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Key used to identify the subscription for this range, `"start:end"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.start, self.end)
    }

    /// Inverse of [`RangeQuery::key`].
    pub fn parse_key(key: &str) -> Result<Self> {
        match key.split_once(':') {
            Some((start, end)) if !end.contains(':') => Ok(Self::new(start, end)),
            _ => Err(GeoError::Internal(format!(
                "not a valid geohash query: {}",
                key
            ))),
        }
    }

    pub fn contains(&self, geohash: &str) -> bool {
        geohash >= self.start.as_str() && geohash < self.end.as_str()
    }
}

impl fmt::Display for RangeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The four kinds of query notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryEventKind {
    Ready,
    KeyEntered,
    KeyExited,
    KeyMoved,
}

impl QueryEventKind {
    pub const ALL: [QueryEventKind; 4] = [
        QueryEventKind::Ready,
        QueryEventKind::KeyEntered,
        QueryEventKind::KeyExited,
        QueryEventKind::KeyMoved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryEventKind::Ready => "ready",
            QueryEventKind::KeyEntered => "key_entered",
            QueryEventKind::KeyExited => "key_exited",
            QueryEventKind::KeyMoved => "key_moved",
        }
    }
}

impl FromStr for QueryEventKind {
    type Err = GeoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(QueryEventKind::Ready),
            "key_entered" => Ok(QueryEventKind::KeyEntered),
            "key_exited" => Ok(QueryEventKind::KeyExited),
            "key_moved" => Ok(QueryEventKind::KeyMoved),
            other => Err(GeoError::UnknownEventType(other.to_string())),
        }
    }
}

impl fmt::Display for QueryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a key notification.
///
/// `location` and `distance` are `None` only for a `key_exited` caused by the
/// key being deleted from the store. Distance is in kilometers.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    pub key: String,
    pub location: Option<Location>,
    pub distance: Option<f64>,
}

/// A notification delivered to query listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    Ready,
    KeyEntered(KeyEvent),
    KeyExited(KeyEvent),
    KeyMoved(KeyEvent),
}

impl QueryEvent {
    pub fn kind(&self) -> QueryEventKind {
        match self {
            QueryEvent::Ready => QueryEventKind::Ready,
            QueryEvent::KeyEntered(_) => QueryEventKind::KeyEntered,
            QueryEvent::KeyExited(_) => QueryEventKind::KeyExited,
            QueryEvent::KeyMoved(_) => QueryEventKind::KeyMoved,
        }
    }

    pub fn key_event(&self) -> Option<&KeyEvent> {
        match self {
            QueryEvent::Ready => None,
            QueryEvent::KeyEntered(e) | QueryEvent::KeyExited(e) | QueryEvent::KeyMoved(e) => {
                Some(e)
            }
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key_event().map(|e| e.key.as_str())
    }
}

/// Point-in-time counters for a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub tracked_entities: usize,
    pub in_query: usize,
    pub active_ranges: usize,
    pub stale_ranges: usize,
    pub outstanding_ranges: usize,
    pub malformed_records: u64,
    pub sweeps: u64,
}

/// Result of a single cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub ranges_retired: usize,
    pub entities_evicted: usize,
}
