//! Bookkeeping behind a live query.
//!
//! `QueryState` never touches the store. Every method mutates the tracked
//! entities and range subscriptions and hands back the events to fire or the
//! store work to do, so the engine can perform both with no lock held.

use crate::compute::coverage::plan_coverage;
use crate::compute::geohash::{MAX_PRECISION, encode, haversine_km};
use crate::compute::validation::validate_criteria;
use crate::config::QueryConfig;
use crate::error::{GeoError, Result};
use crate::storage::SubscriptionHandle;
use crate::types::{
    KeyEvent, Location, QueryCriteria, QueryEvent, QueryStats, RangeQuery, SweepStats,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Last known state of a key seen through one of the ranges.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TrackedEntity {
    pub location: Location,
    /// Kilometers from the query center.
    pub distance: f64,
    pub in_query: bool,
    /// Encoded at full length so it compares correctly against ranges of any
    /// depth, whatever precision the records were written with.
    pub geohash: String,
}

#[derive(Debug)]
struct RangeSubscription {
    range: RangeQuery,
    /// False once the range dropped out of the plan. Stale ranges keep
    /// delivering until the next sweep retires them.
    active: bool,
    settled: bool,
    /// Distinguishes this subscription from earlier ones on the same range.
    serial: u64,
    handle: Option<SubscriptionHandle>,
}

/// A range that needs a store subscription.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingRange {
    pub key: String,
    pub range: RangeQuery,
    pub serial: u64,
}

/// Outcome of replanning the ranges.
#[derive(Debug, Default)]
pub(crate) struct RangePlan {
    pub to_subscribe: Vec<PendingRange>,
    pub schedule_cleanup: bool,
    pub ready: Option<QueryEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepTrigger {
    Manual,
    Deferred,
    Periodic,
}

pub(crate) struct QueryState {
    center: Location,
    radius: f64,
    cleanup_threshold: usize,
    tracked: FxHashMap<String, TrackedEntity>,
    ranges: FxHashMap<String, RangeSubscription>,
    outstanding: FxHashSet<String>,
    ready: bool,
    cancelled: bool,
    cleanup_scheduled: bool,
    next_serial: u64,
    malformed_records: u64,
    sweeps: u64,
}

impl QueryState {
    /// `center` and `radius` must already be validated.
    pub fn new(center: Location, radius: f64, config: &QueryConfig) -> Self {
        Self {
            center,
            radius,
            cleanup_threshold: config.cleanup_threshold,
            tracked: FxHashMap::default(),
            ranges: FxHashMap::default(),
            outstanding: FxHashSet::default(),
            ready: false,
            cancelled: false,
            cleanup_scheduled: false,
            next_serial: 0,
            malformed_records: 0,
            sweeps: 0,
        }
    }

    pub fn center(&self) -> Location {
        self.center
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.tracked.contains_key(key)
    }

    /// Whether events tagged with `serial` for `range_key` should be applied.
    pub fn is_current(&self, range_key: &str, serial: u64) -> bool {
        !self.cancelled
            && self
                .ranges
                .get(range_key)
                .is_some_and(|sub| sub.serial == serial)
    }

    /// Whether any subscribed range, active or stale, covers `geohash`.
    pub fn geohash_in_some_query(&self, geohash: &str) -> bool {
        self.ranges.values().any(|sub| sub.range.contains(geohash))
    }

    pub fn record_malformed(&mut self) {
        self.malformed_records += 1;
    }

    /// Records the latest location of `key` and returns at most one of
    /// entered, moved or exited.
    pub fn update_location(&mut self, key: &str, location: Location) -> Result<Option<QueryEvent>> {
        let geohash = encode(&location, MAX_PRECISION)?;
        let distance = haversine_km(&location, &self.center);
        let in_query = distance <= self.radius;

        let previous = self.tracked.insert(
            key.to_string(),
            TrackedEntity {
                location,
                distance,
                in_query,
                geohash,
            },
        );
        let (was_in_query, old_location) = match previous {
            Some(entity) => (entity.in_query, Some(entity.location)),
            None => (false, None),
        };

        let payload = KeyEvent {
            key: key.to_string(),
            location: Some(location),
            distance: Some(distance),
        };
        let event = if in_query && !was_in_query {
            Some(QueryEvent::KeyEntered(payload))
        } else if in_query && old_location.is_some_and(|old| old != location) {
            Some(QueryEvent::KeyMoved(payload))
        } else if !in_query && was_in_query {
            Some(QueryEvent::KeyExited(payload))
        } else {
            None
        };
        Ok(event)
    }

    /// Stops tracking `key`. Fires exited only if it was in the query.
    pub fn remove_location(&mut self, key: &str, current: Option<Location>) -> Option<QueryEvent> {
        let entity = self.tracked.remove(key)?;
        if !entity.in_query {
            return None;
        }
        Some(QueryEvent::KeyExited(KeyEvent {
            key: key.to_string(),
            location: current,
            distance: current.map(|location| haversine_km(&location, &self.center)),
        }))
    }

    /// Handles a key leaving one of the ranges, given its current stored
    /// location (`None` once deleted). A key that moved into another watched
    /// range stays tracked; that range reports the new location.
    pub fn resolve_removal(&mut self, key: &str, current: Option<Location>) -> Result<Option<QueryEvent>> {
        if !self.tracked.contains_key(key) {
            return Ok(None);
        }
        if let Some(location) = &current {
            let geohash = encode(location, MAX_PRECISION)?;
            if self.geohash_in_some_query(&geohash) {
                return Ok(None);
            }
        }
        Ok(self.remove_location(key, current))
    }

    /// Merges new criteria and recomputes membership of every tracked key.
    ///
    /// Only entered and exited are produced here. Readiness resets until the
    /// next plan settles.
    pub fn apply_criteria(&mut self, criteria: &QueryCriteria) -> Result<Vec<QueryEvent>> {
        validate_criteria(criteria, false)?;
        if let Some(center) = criteria.center {
            self.center = center;
        }
        if let Some(radius) = criteria.radius {
            self.radius = radius;
        }

        let mut events = Vec::new();
        for (key, entity) in self.tracked.iter_mut() {
            let was_in_query = entity.in_query;
            entity.distance = haversine_km(&entity.location, &self.center);
            entity.in_query = entity.distance <= self.radius;

            let payload = || KeyEvent {
                key: key.clone(),
                location: Some(entity.location),
                distance: Some(entity.distance),
            };
            if was_in_query && !entity.in_query {
                events.push(QueryEvent::KeyExited(payload()));
            } else if !was_in_query && entity.in_query {
                events.push(QueryEvent::KeyEntered(payload()));
            }
        }
        events.sort_by(|a, b| a.key().cmp(&b.key()));

        self.ready = false;
        Ok(events)
    }

    /// Diffs the coverage of the current criteria against the ranges already
    /// subscribed. Kept ranges are reactivated, dropped ones go stale and new
    /// ones are returned for subscription.
    pub fn plan_ranges(&mut self) -> Result<RangePlan> {
        let wanted: Vec<(String, RangeQuery)> = plan_coverage(&self.center, self.radius * 1000.0)?
            .into_iter()
            .map(|range| (range.key(), range))
            .collect();

        for (key, sub) in self.ranges.iter_mut() {
            sub.active = wanted.iter().any(|(wanted_key, _)| wanted_key == key);
        }

        let mut to_subscribe = Vec::new();
        for (key, range) in &wanted {
            if self.ranges.contains_key(key) {
                continue;
            }
            let serial = self.next_serial;
            self.next_serial += 1;
            self.ranges.insert(
                key.clone(),
                RangeSubscription {
                    range: range.clone(),
                    active: true,
                    settled: false,
                    serial,
                    handle: None,
                },
            );
            to_subscribe.push(PendingRange {
                key: key.clone(),
                range: range.clone(),
                serial,
            });
        }

        self.outstanding = wanted
            .iter()
            .filter(|(key, _)| self.ranges.get(key).is_some_and(|sub| !sub.settled))
            .map(|(key, _)| key.clone())
            .collect();

        let schedule_cleanup =
            !self.cleanup_scheduled && self.ranges.len() > self.cleanup_threshold;
        if schedule_cleanup {
            self.cleanup_scheduled = true;
        }

        let ready = if self.outstanding.is_empty() && !self.ready {
            self.ready = true;
            Some(QueryEvent::Ready)
        } else {
            None
        };

        Ok(RangePlan {
            to_subscribe,
            schedule_cleanup,
            ready,
        })
    }

    /// Stores the handle of a finished subscription. Returns false if the
    /// range was retired or replaced meanwhile; the caller then owns the
    /// handle and must release it.
    pub fn attach_handle(&mut self, range_key: &str, serial: u64, handle: SubscriptionHandle) -> bool {
        if self.cancelled {
            return false;
        }
        match self.ranges.get_mut(range_key) {
            Some(sub) if sub.serial == serial => {
                sub.handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Forgets a range the store refused to subscribe.
    pub fn subscription_failed(&mut self, range_key: &str, serial: u64) {
        if self.is_current(range_key, serial) {
            self.ranges.remove(range_key);
            self.outstanding.remove(range_key);
        }
    }

    /// Marks the initial load of a range complete. Returns ready when this was
    /// the last outstanding range of the current plan.
    pub fn mark_settled(&mut self, range_key: &str, serial: u64) -> Option<QueryEvent> {
        if !self.is_current(range_key, serial) {
            return None;
        }
        if let Some(sub) = self.ranges.get_mut(range_key) {
            sub.settled = true;
        }
        if self.outstanding.remove(range_key) && self.outstanding.is_empty() && !self.ready {
            self.ready = true;
            return Some(QueryEvent::Ready);
        }
        None
    }

    /// Retires stale ranges and forgets keys no remaining range covers.
    ///
    /// Fails without changing anything if a key that is still inside the
    /// query would be forgotten. Returns the handles to unsubscribe.
    pub fn sweep(&mut self, trigger: SweepTrigger) -> Result<(SweepStats, Vec<SubscriptionHandle>)> {
        if self.cancelled || (trigger == SweepTrigger::Periodic && self.cleanup_scheduled) {
            return Ok((SweepStats::default(), Vec::new()));
        }
        if trigger != SweepTrigger::Periodic {
            self.cleanup_scheduled = false;
        }

        let retained: Vec<&RangeQuery> = self
            .ranges
            .values()
            .filter(|sub| sub.active)
            .map(|sub| &sub.range)
            .collect();

        let mut evicted = Vec::new();
        for (key, entity) in &self.tracked {
            if retained.iter().any(|range| range.contains(&entity.geohash)) {
                continue;
            }
            if entity.in_query {
                return Err(GeoError::Internal(format!(
                    "location '{}' is still in query but no active range covers {}",
                    key, entity.geohash
                )));
            }
            evicted.push(key.clone());
        }

        let stale: Vec<String> = self
            .ranges
            .iter()
            .filter(|(_, sub)| !sub.active)
            .map(|(key, _)| key.clone())
            .collect();
        let mut handles = Vec::new();
        for key in &stale {
            self.outstanding.remove(key);
            if let Some(handle) = self.ranges.remove(key).and_then(|sub| sub.handle) {
                handles.push(handle);
            }
        }
        for key in &evicted {
            self.tracked.remove(key);
        }

        self.sweeps += 1;
        Ok((
            SweepStats {
                ranges_retired: stale.len(),
                entities_evicted: evicted.len(),
            },
            handles,
        ))
    }

    /// Drops all state. Returns the handles to unsubscribe, or `None` if the
    /// query was already cancelled.
    pub fn cancel(&mut self) -> Option<Vec<SubscriptionHandle>> {
        if self.cancelled {
            return None;
        }
        self.cancelled = true;
        self.ready = false;
        self.cleanup_scheduled = false;
        self.tracked.clear();
        self.outstanding.clear();
        Some(
            self.ranges
                .drain()
                .filter_map(|(_, sub)| sub.handle)
                .collect(),
        )
    }

    /// Payloads of every key currently inside the query, ordered by key.
    pub fn in_query_snapshot(&self) -> Vec<KeyEvent> {
        let mut entered: Vec<KeyEvent> = self
            .tracked
            .iter()
            .filter(|(_, entity)| entity.in_query)
            .map(|(key, entity)| KeyEvent {
                key: key.clone(),
                location: Some(entity.location),
                distance: Some(entity.distance),
            })
            .collect();
        entered.sort_by(|a, b| a.key.cmp(&b.key));
        entered
    }

    pub fn tracked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tracked.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> QueryStats {
        let active_ranges = self.ranges.values().filter(|sub| sub.active).count();
        QueryStats {
            tracked_entities: self.tracked.len(),
            in_query: self.tracked.values().filter(|e| e.in_query).count(),
            active_ranges,
            stale_ranges: self.ranges.len() - active_ranges,
            outstanding_ranges: self.outstanding.len(),
            malformed_records: self.malformed_records,
            sweeps: self.sweeps,
        }
    }
}
