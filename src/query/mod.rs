//! Live radius queries over a [`GeoStore`].
//!
//! A [`GeoQuery`] covers its circle with geohash ranges, subscribes to each of
//! them, and turns the store's range notifications into key-level events:
//!
//! - `key_entered` when a key moves into the circle or is first seen inside it
//! - `key_moved` when a key inside the circle changes location
//! - `key_exited` when a key leaves the circle or is deleted
//! - `ready` once every range of the current criteria finished its initial load
//!
//! # Locking
//!
//! Stores may deliver notifications synchronously from inside a subscribe or
//! write call, and listeners may call back into the query. The query therefore
//! never holds its own lock while calling the store or a listener: events are
//! collected under the lock and dispatched after it is released.

mod listeners;
mod state;
mod sweeper;

pub use listeners::{Callback, CallbackRegistration};

use crate::builder::QueryBuilder;
use crate::compute::validation::validate_criteria;
use crate::config::QueryConfig;
use crate::error::{GeoError, Result};
use crate::storage::{
    GeoStore, INDEX_FIELD, RangeEvent, RangeSink, SubscriptionHandle, decode_record,
};
use crate::types::{Location, QueryCriteria, QueryEvent, QueryEventKind, QueryStats, SweepStats};
use listeners::Listeners;
use parking_lot::Mutex;
use serde_json::Value;
use state::{PendingRange, QueryState, SweepTrigger};
use std::fmt;
use std::sync::{Arc, Weak};
use sweeper::Sweeper;
use uuid::Uuid;

/// A live query for keys within a radius of a center.
///
/// Cloning is cheap and every clone refers to the same query. The query is
/// cancelled when [`cancel`](Self::cancel) is called or the last clone is
/// dropped.
///
/// ```rust
/// use geowatch::{GeoQuery, Location, LocationStore, QueryCriteria, QueryEventKind};
/// use geowatch::storage::MemoryStore;
/// use std::sync::Arc;
///
/// # fn main() -> geowatch::Result<()> {
/// let locations = LocationStore::new(Arc::new(MemoryStore::new()));
/// locations.set("fish0", Location::new(0.5, 0.5))?;
///
/// let query = locations.query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))?;
/// let registration = query.on(QueryEventKind::KeyEntered, |event| {
///     println!("{:?} entered", event.key());
/// });
/// assert_eq!(query.tracked_keys(), vec!["fish0".to_string()]);
///
/// registration.cancel();
/// query.cancel();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GeoQuery {
    inner: Arc<QueryInner>,
}

struct QueryInner {
    id: Uuid,
    store: Arc<dyn GeoStore>,
    config: QueryConfig,
    state: Mutex<QueryState>,
    listeners: Arc<Mutex<Listeners>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl GeoQuery {
    /// Creates a query with the default configuration.
    ///
    /// Both `center` and `radius` (kilometers) are required.
    pub fn new(store: Arc<dyn GeoStore>, criteria: QueryCriteria) -> Result<Self> {
        Self::with_config(store, criteria, QueryConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn GeoStore>,
        criteria: QueryCriteria,
        config: QueryConfig,
    ) -> Result<Self> {
        validate_criteria(&criteria, true)?;
        config.validate().map_err(GeoError::Config)?;
        let (Some(center), Some(radius)) = (criteria.center, criteria.radius) else {
            return Err(GeoError::InvalidCriteria(
                "query criteria for a new query must contain both a center and a radius".into(),
            ));
        };

        let inner = Arc::new(QueryInner {
            id: Uuid::new_v4(),
            store,
            state: Mutex::new(QueryState::new(center, radius, &config)),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            sweeper: Mutex::new(None),
            config,
        });
        inner.start_sweeper()?;

        log::debug!(
            "query {}: created at {} with radius {} km",
            inner.id,
            center,
            radius
        );

        let query = Self { inner };
        let plan = query.inner.state.lock().plan_ranges()?;
        query.inner.apply_plan(plan.to_subscribe, plan.schedule_cleanup, plan.ready)?;
        Ok(query)
    }

    /// Starts building a query on `store`.
    pub fn builder(store: Arc<dyn GeoStore>) -> QueryBuilder {
        QueryBuilder::new(store)
    }

    /// Unique id of this query, used in log lines.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn center(&self) -> Location {
        self.inner.state.lock().center()
    }

    /// Radius in kilometers.
    pub fn radius(&self) -> f64 {
        self.inner.state.lock().radius()
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Whether the initial load for the current criteria has completed.
    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().is_ready()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().is_cancelled()
    }

    /// Keys currently tracked, in or out of the circle, sorted.
    pub fn tracked_keys(&self) -> Vec<String> {
        self.inner.state.lock().tracked_keys()
    }

    pub fn stats(&self) -> QueryStats {
        self.inner.state.lock().stats()
    }

    /// Registers `callback` for events of `kind`.
    ///
    /// A new `key_entered` listener is immediately called for every key
    /// already inside the query, and a new `ready` listener is called at once
    /// if the query is ready. On a cancelled query nothing is registered and
    /// the returned registration is already cancelled.
    pub fn on<F>(&self, kind: QueryEventKind, callback: F) -> CallbackRegistration
    where
        F: Fn(&QueryEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);

        let (id, replay) = {
            let state = self.inner.state.lock();
            if state.is_cancelled() {
                return CallbackRegistration::inert();
            }
            let Some(id) = self.inner.listeners.lock().add(kind, callback.clone()) else {
                return CallbackRegistration::inert();
            };
            let replay: Vec<QueryEvent> = match kind {
                QueryEventKind::KeyEntered => state
                    .in_query_snapshot()
                    .into_iter()
                    .map(QueryEvent::KeyEntered)
                    .collect(),
                QueryEventKind::Ready if state.is_ready() => vec![QueryEvent::Ready],
                _ => Vec::new(),
            };
            (id, replay)
        };

        for event in &replay {
            if !self.inner.listeners.lock().contains(kind, id) {
                break;
            }
            callback(event);
        }

        let listeners = Arc::downgrade(&self.inner.listeners);
        CallbackRegistration::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().remove(kind, id);
            }
        })
    }

    /// Parses `event_type` (`"ready"`, `"key_entered"`, `"key_exited"` or
    /// `"key_moved"`) and registers `callback` for it.
    pub fn on_event<F>(&self, event_type: &str, callback: F) -> Result<CallbackRegistration>
    where
        F: Fn(&QueryEvent) + Send + Sync + 'static,
    {
        let kind: QueryEventKind = event_type.parse()?;
        Ok(self.on(kind, callback))
    }

    /// Changes the center and/or radius.
    ///
    /// Keys whose membership changed fire entered or exited right away; moved
    /// is never fired here. Ready fires again once the new ranges settle, or
    /// immediately when the covering ranges did not change.
    pub fn update_criteria(&self, criteria: QueryCriteria) -> Result<()> {
        let (events, plan) = {
            let mut state = self.inner.state.lock();
            if state.is_cancelled() {
                return Err(GeoError::Cancelled);
            }
            let events = state.apply_criteria(&criteria)?;
            let plan = state.plan_ranges()?;
            (events, plan)
        };

        log::debug!(
            "query {}: criteria updated, {} membership change(s), {} new range(s)",
            self.inner.id,
            events.len(),
            plan.to_subscribe.len()
        );

        self.inner.dispatch(events);
        self.inner
            .apply_plan(plan.to_subscribe, plan.schedule_cleanup, plan.ready)
    }

    /// Runs a cleanup pass now.
    ///
    /// Retires ranges that fell out of the plan and forgets keys that no
    /// remaining range covers.
    pub fn sweep(&self) -> Result<SweepStats> {
        self.inner.run_sweep(SweepTrigger::Manual)
    }

    /// Stops the query. Listeners are dropped, store subscriptions released
    /// and no further events are delivered. Calling it again has no effect.
    pub fn cancel(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for GeoQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("GeoQuery")
            .field("id", &self.inner.id)
            .field("center", &state.center())
            .field("radius", &state.radius())
            .field("ready", &state.is_ready())
            .field("cancelled", &state.is_cancelled())
            .finish()
    }
}

impl QueryInner {
    fn start_sweeper(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let id = self.id;
        let sweeper = Sweeper::spawn(
            format!("geowatch-sweeper-{}", self.id.simple()),
            self.config.sweep_interval(),
            move |trigger| {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                if let Err(e) = inner.run_sweep(trigger) {
                    log::error!("query {}: {:?} sweep failed: {}", id, trigger, e);
                }
                true
            },
        )
        .map_err(|e| GeoError::Internal(format!("failed to start sweeper: {}", e)))?;
        *self.sweeper.lock() = Some(sweeper);
        Ok(())
    }

    fn apply_plan(
        self: &Arc<Self>,
        to_subscribe: Vec<PendingRange>,
        schedule_cleanup: bool,
        ready: Option<QueryEvent>,
    ) -> Result<()> {
        if schedule_cleanup {
            if let Some(sweeper) = self.sweeper.lock().as_ref() {
                sweeper.schedule(self.config.cleanup_delay());
            }
        }
        self.dispatch(ready);
        self.subscribe_ranges(to_subscribe)
    }

    /// Subscribes every pending range. All ranges are attempted; the first
    /// failure is returned.
    fn subscribe_ranges(self: &Arc<Self>, pending: Vec<PendingRange>) -> Result<()> {
        let mut first_error = None;
        for range in pending {
            let sink = self.sink_for(&range.key, range.serial);
            match self.store.subscribe_range(INDEX_FIELD, &range.range, sink) {
                Ok(handle) => {
                    let attached = self
                        .state
                        .lock()
                        .attach_handle(&range.key, range.serial, handle);
                    if !attached {
                        self.release(handle);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "query {}: failed to subscribe {}: {}",
                        self.id,
                        range.range,
                        e
                    );
                    self.state
                        .lock()
                        .subscription_failed(&range.key, range.serial);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn sink_for(self: &Arc<Self>, range_key: &str, serial: u64) -> RangeSink {
        let weak: Weak<QueryInner> = Arc::downgrade(self);
        let range_key = range_key.to_string();
        Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_range_event(&range_key, serial, event);
            }
        })
    }

    fn handle_range_event(&self, range_key: &str, serial: u64, event: RangeEvent) {
        match event {
            RangeEvent::Added { key, value } | RangeEvent::Changed { key, value } => {
                self.handle_upsert(range_key, serial, &key, &value)
            }
            RangeEvent::Removed { key } => self.handle_removed(range_key, serial, &key),
            RangeEvent::Settled => {
                let ready = self.state.lock().mark_settled(range_key, serial);
                if ready.is_some() {
                    log::debug!("query {}: ready", self.id);
                }
                self.dispatch(ready);
            }
        }
    }

    fn handle_upsert(&self, range_key: &str, serial: u64, key: &str, value: &Value) {
        let event = {
            let mut state = self.state.lock();
            if !state.is_current(range_key, serial) {
                return;
            }
            let location = match decode_record(key, value) {
                Ok(location) => location,
                Err(e) => {
                    state.record_malformed();
                    log::error!("query {}: skipping record: {}", self.id, e);
                    return;
                }
            };
            match state.update_location(key, location) {
                Ok(event) => event,
                Err(e) => {
                    log::error!("query {}: failed to track '{}': {}", self.id, key, e);
                    return;
                }
            }
        };
        self.dispatch(event);
    }

    /// A key left one of the ranges. It may have been deleted, or moved into
    /// a neighbouring range, so the stored record decides what happened.
    fn handle_removed(&self, range_key: &str, serial: u64, key: &str) {
        {
            let state = self.state.lock();
            if !state.is_current(range_key, serial) || !state.is_tracked(key) {
                return;
            }
        }

        let current = match self.store.read(key) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("query {}: failed to read '{}': {}", self.id, key, e);
                return;
            }
        };

        let event = {
            let mut state = self.state.lock();
            if state.is_cancelled() {
                return;
            }
            let location = match current.as_ref().map(|value| decode_record(key, value)) {
                None => None,
                Some(Ok(location)) => Some(location),
                Some(Err(e)) => {
                    state.record_malformed();
                    log::error!("query {}: skipping record: {}", self.id, e);
                    return;
                }
            };
            match state.resolve_removal(key, location) {
                Ok(event) => event,
                Err(e) => {
                    log::error!("query {}: failed to resolve '{}': {}", self.id, key, e);
                    return;
                }
            }
        };
        self.dispatch(event);
    }

    /// Calls the listeners for each event in order. A listener cancelled by an
    /// earlier callback of the same dispatch is skipped.
    fn dispatch(&self, events: impl IntoIterator<Item = QueryEvent>) {
        for event in events {
            let kind = event.kind();
            let callbacks = self.listeners.lock().snapshot(kind);
            for (id, callback) in callbacks {
                if !self.listeners.lock().contains(kind, id) {
                    continue;
                }
                callback(&event);
            }
        }
    }

    fn run_sweep(&self, trigger: SweepTrigger) -> Result<SweepStats> {
        let (stats, handles) = self.state.lock().sweep(trigger)?;
        for handle in handles {
            self.release(handle);
        }
        if stats != SweepStats::default() {
            log::debug!(
                "query {}: sweep retired {} range(s), evicted {} key(s)",
                self.id,
                stats.ranges_retired,
                stats.entities_evicted
            );
        }
        Ok(stats)
    }

    fn release(&self, handle: SubscriptionHandle) {
        if let Err(e) = self.store.unsubscribe_range(handle) {
            log::warn!(
                "query {}: failed to unsubscribe #{}: {}",
                self.id,
                handle.id(),
                e
            );
        }
    }

    fn shutdown(&self) {
        let Some(handles) = self.state.lock().cancel() else {
            return;
        };
        self.listeners.lock().close();
        let sweeper = self.sweeper.lock().take();
        if let Some(mut sweeper) = sweeper {
            sweeper.stop();
        }
        for handle in handles {
            self.release(handle);
        }
        log::debug!("query {}: cancelled", self.id);
    }
}

impl Drop for QueryInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
