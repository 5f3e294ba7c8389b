use geowatch::prelude::*;
use geowatch::storage::{RangeEvent, RangeSink, SubscriptionHandle};
use geowatch::{CallbackRegistration, RangeQuery, StoreError, StoreResult, SweepStats};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::sleep;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Memory store whose subscriptions can be made to fail on demand.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_subscribe: AtomicBool,
}

impl GeoStore for FlakyStore {
    fn subscribe_range(
        &self,
        field: &str,
        range: &RangeQuery,
        sink: RangeSink,
    ) -> StoreResult<SubscriptionHandle> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(StoreError::Subscribe("permission denied".into()));
        }
        self.inner.subscribe_range(field, range, sink)
    }

    fn unsubscribe_range(&self, handle: SubscriptionHandle) -> StoreResult<()> {
        self.inner.unsubscribe_range(handle)
    }

    fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        self.inner.read(key)
    }

    fn write_many(&self, updates: BTreeMap<String, Option<Value>>) -> StoreResult<()> {
        self.inner.write_many(updates)
    }
}

/// Memory store that holds back settle notifications until flushed.
#[derive(Default)]
struct DeferredSettleStore {
    inner: MemoryStore,
    held: Arc<Mutex<Vec<RangeSink>>>,
}

impl DeferredSettleStore {
    fn held(&self) -> usize {
        self.held.lock().len()
    }

    /// Delivers the oldest `count` held settles.
    fn flush(&self, count: usize) {
        let sinks: Vec<RangeSink> = {
            let mut held = self.held.lock();
            let count = count.min(held.len());
            held.drain(..count).collect()
        };
        for sink in sinks {
            sink(RangeEvent::Settled);
        }
    }
}

impl GeoStore for DeferredSettleStore {
    fn subscribe_range(
        &self,
        field: &str,
        range: &RangeQuery,
        sink: RangeSink,
    ) -> StoreResult<SubscriptionHandle> {
        let held = self.held.clone();
        let target = sink.clone();
        let wrapped: RangeSink = Arc::new(move |event| match event {
            RangeEvent::Settled => held.lock().push(target.clone()),
            other => target(other),
        });
        self.inner.subscribe_range(field, range, wrapped)
    }

    fn unsubscribe_range(&self, handle: SubscriptionHandle) -> StoreResult<()> {
        self.inner.unsubscribe_range(handle)
    }

    fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        self.inner.read(key)
    }

    fn write_many(&self, updates: BTreeMap<String, Option<Value>>) -> StoreResult<()> {
        self.inner.write_many(updates)
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10));
    }
    condition()
}

/// Test 1: Cancelling from inside a callback stops the rest of the batch
#[test]
fn test_cancel_inside_callback() {
    init();
    let memory = Arc::new(MemoryStore::new());
    let locations = LocationStore::new(memory.clone());
    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))
        .unwrap();

    let entered = Arc::new(AtomicUsize::new(0));
    let counter = entered.clone();
    let handle = query.clone();
    query.on(QueryEventKind::KeyEntered, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        handle.cancel();
    });

    locations
        .set_many([
            ("a", Some(Location::new(0.1, 0.1))),
            ("b", Some(Location::new(0.1, 0.1))),
            ("c", Some(Location::new(0.1, 0.1))),
        ])
        .unwrap();

    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert!(query.is_cancelled());
    assert!(query.tracked_keys().is_empty());
    assert_eq!(memory.stats().subscription_count, 0);
}

/// Test 2: A listener cancelled mid-dispatch is skipped for that event
#[test]
fn test_listener_cancelled_during_dispatch() {
    init();
    let locations = LocationStore::new(Arc::new(MemoryStore::new()));
    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))
        .unwrap();

    let victim: Arc<Mutex<Option<CallbackRegistration>>> = Arc::new(Mutex::new(None));
    let slot = victim.clone();
    let _killer = query.on(QueryEventKind::KeyEntered, move |_| {
        if let Some(registration) = slot.lock().as_ref() {
            registration.cancel();
        }
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    *victim.lock() = Some(query.on(QueryEventKind::KeyEntered, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    locations.set("a", Location::new(0.0, 0.0)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Test 3: A malformed record is skipped without breaking the range
#[test]
fn test_malformed_record_is_isolated() {
    init();
    let memory = Arc::new(MemoryStore::new());
    let locations = LocationStore::new(memory.clone());
    memory
        .write("broken", Some(json!({ "g": "7zzzzzzzzz", "l": "nowhere" })))
        .unwrap();
    locations.set("fine", Location::new(0.0, 0.0)).unwrap();

    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 10.0))
        .unwrap();

    assert!(query.is_ready());
    assert_eq!(query.tracked_keys(), vec!["fine".to_string()]);
    assert_eq!(query.stats().malformed_records, 1);

    // the same subscription keeps delivering
    locations.set("later", Location::new(0.01, 0.01)).unwrap();
    assert_eq!(
        query.tracked_keys(),
        vec!["fine".to_string(), "later".to_string()]
    );
}

/// Test 4: Subscription failures reach the caller
#[test]
fn test_subscription_failure_surfaces() {
    init();
    let store = Arc::new(FlakyStore::default());
    store.fail_subscribe.store(true, Ordering::SeqCst);

    let err = GeoQuery::new(
        store.clone(),
        QueryCriteria::new(Location::new(0.0, 0.0), 10.0),
    )
    .unwrap_err();
    assert!(matches!(err, GeoError::Store(StoreError::Subscribe(_))));
    assert_eq!(store.inner.stats().subscription_count, 0);

    store.fail_subscribe.store(false, Ordering::SeqCst);
    let query = GeoQuery::new(
        store.clone(),
        QueryCriteria::new(Location::new(0.0, 0.0), 10.0),
    )
    .unwrap();
    assert!(query.is_ready());

    store.fail_subscribe.store(true, Ordering::SeqCst);
    let err = query
        .update_criteria(QueryCriteria::center(Location::new(45.0, 45.0)))
        .unwrap_err();
    assert!(matches!(err, GeoError::Store(_)));
    assert!(!query.is_ready());
}

/// Test 5: Late settles from superseded ranges do not make the query ready
#[test]
fn test_ready_waits_for_current_ranges() {
    init();
    let store = Arc::new(DeferredSettleStore::default());
    let query = GeoQuery::new(
        store.clone(),
        QueryCriteria::new(Location::new(0.0, 0.0), 10.0),
    )
    .unwrap();

    let ready = Arc::new(AtomicUsize::new(0));
    let counter = ready.clone();
    query.on(QueryEventKind::Ready, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let initial = store.held();
    assert!(initial > 0);
    assert!(!query.is_ready());

    query
        .update_criteria(QueryCriteria::center(Location::new(60.0, 60.0)))
        .unwrap();
    assert!(store.held() > initial);

    store.flush(initial);
    assert_eq!(ready.load(Ordering::SeqCst), 0);
    assert!(!query.is_ready());

    store.flush(usize::MAX);
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert!(query.is_ready());
}

/// Test 6: Crossing the range threshold triggers a deferred sweep
#[test]
fn test_threshold_sweep_retires_stale_ranges() {
    init();
    let memory = Arc::new(MemoryStore::new());
    let config = QueryConfig::default()
        .with_cleanup_threshold(1)
        .with_cleanup_delay(Duration::from_millis(1))
        .with_sweep_interval(Duration::ZERO);
    let locations = LocationStore::with_config(memory.clone(), config).unwrap();
    locations.set("old", Location::new(0.0, 0.0)).unwrap();

    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 10.0))
        .unwrap();
    assert_eq!(query.tracked_keys(), vec!["old".to_string()]);

    query
        .update_criteria(QueryCriteria::center(Location::new(30.0, 30.0)))
        .unwrap();

    let settled = wait_until(|| {
        let stats = query.stats();
        stats.stale_ranges == 0
            && stats.sweeps >= 1
            && stats.tracked_entities == 0
            && memory.stats().subscription_count == stats.active_ranges
    });
    assert!(settled, "sweep did not run: {:?}", query.stats());
}

/// Test 7: Manual sweeps forget keys the new ranges no longer cover
#[test]
fn test_manual_sweep() {
    init();
    let memory = Arc::new(MemoryStore::new());
    let locations = LocationStore::new(memory.clone());
    locations
        .set_many([
            ("a", Some(Location::new(0.0, 0.0))),
            ("b", Some(Location::new(0.01, 0.0))),
        ])
        .unwrap();

    let query = GeoQuery::builder(memory.clone())
        .center(Location::new(0.0, 0.0))
        .radius(5.0)
        .sweep_interval(Duration::ZERO)
        .build()
        .unwrap();
    assert_eq!(query.stats().in_query, 2);
    let active_before = query.stats().active_ranges;

    query
        .update_criteria(QueryCriteria::center(Location::new(-45.0, 120.0)))
        .unwrap();
    assert_eq!(query.stats().in_query, 0);
    assert_eq!(query.stats().stale_ranges, active_before);

    let stats = query.sweep().unwrap();
    assert_eq!(stats.ranges_retired, active_before);
    assert_eq!(stats.entities_evicted, 2);
    assert!(query.tracked_keys().is_empty());
    assert_eq!(
        memory.stats().subscription_count,
        query.stats().active_ranges
    );

    // nothing left to do
    assert_eq!(query.sweep().unwrap(), SweepStats::default());
}

/// Test 8: Invalid criteria are rejected before anything is subscribed
#[test]
fn test_invalid_criteria() {
    init();
    let memory = Arc::new(MemoryStore::new());
    let cases = [
        QueryCriteria::default(),
        QueryCriteria::radius(10.0),
        QueryCriteria::center(Location::new(0.0, 0.0)),
        QueryCriteria::new(Location::new(91.0, 0.0), 10.0),
        QueryCriteria::new(Location::new(0.0, -181.0), 10.0),
        QueryCriteria::new(Location::new(0.0, 0.0), -1.0),
        QueryCriteria::new(Location::new(0.0, 0.0), f64::NAN),
    ];
    for criteria in cases {
        let err = GeoQuery::new(memory.clone(), criteria).unwrap_err();
        assert!(err.is_validation(), "{:?} -> {}", criteria, err);
    }
    assert_eq!(memory.stats().subscription_count, 0);

    let query = GeoQuery::new(
        memory.clone(),
        QueryCriteria::new(Location::new(0.0, 0.0), 10.0),
    )
    .unwrap();
    assert!(query.update_criteria(QueryCriteria::default()).is_err());
    assert!(
        query
            .update_criteria(QueryCriteria::center(Location::new(0.0, 200.0)))
            .is_err()
    );
    assert_eq!(query.center(), Location::new(0.0, 0.0));
}

/// Test 9: Criteria parsed from JSON reject unknown attributes
#[test]
fn test_criteria_from_json() {
    let criteria = QueryCriteria::from_json(r#"{ "center": [1, 2], "radius": 1000 }"#).unwrap();
    assert_eq!(criteria, QueryCriteria::new(Location::new(1.0, 2.0), 1000.0));

    let err = QueryCriteria::from_json(r#"{ "center": [1, 2], "radius": 1000, "foo": 1 }"#)
        .unwrap_err();
    assert!(matches!(err, GeoError::InvalidCriteria(_)));
}

/// Test 10: Keys at the poles and the antimeridian are tracked
#[test]
fn test_extreme_coordinates() {
    init();
    let memory = Arc::new(MemoryStore::new());
    let locations = LocationStore::new(memory.clone());
    locations
        .set_many([
            ("north", Some(Location::new(90.0, 45.0))),
            // across the pole from the query center
            ("over_the_top", Some(Location::new(89.8, -135.0))),
            ("south", Some(Location::new(-89.95, 120.0))),
            ("east", Some(Location::new(0.0, 180.0))),
            ("west", Some(Location::new(0.0, -180.0))),
        ])
        .unwrap();

    let polar = locations
        .query(QueryCriteria::new(Location::new(89.5, 45.0), 100.0))
        .unwrap();
    assert_eq!(polar.stats().in_query, 2);
    assert!(polar.tracked_keys().contains(&"over_the_top".to_string()));

    let southern = locations
        .query(QueryCriteria::new(Location::new(-89.9, 0.0), 50.0))
        .unwrap();
    assert_eq!(southern.stats().in_query, 1);
    assert!(southern.tracked_keys().contains(&"south".to_string()));

    let dateline = locations
        .query(QueryCriteria::new(Location::new(0.0, 179.9), 50.0))
        .unwrap();
    assert!(dateline.tracked_keys().contains(&"east".to_string()));
    assert!(dateline.is_ready());
}

/// Test 11: Queries compare against full-length hashes whatever their precision
#[test]
fn test_sweep_with_short_query_precision() {
    init();
    let memory = Arc::new(MemoryStore::new());
    let locations = LocationStore::new(memory.clone());
    locations.set("a", Location::new(0.0, 0.0)).unwrap();

    let query = GeoQuery::builder(memory.clone())
        .center(Location::new(0.0, 0.0))
        .radius(1.0)
        .precision(3)
        .cleanup_threshold(1_000)
        .sweep_interval(Duration::ZERO)
        .build()
        .unwrap();
    assert_eq!(query.stats().in_query, 1);
    assert_eq!(query.sweep().unwrap(), SweepStats::default());

    for center in [
        Location::new(30.0, 30.0),
        Location::new(-30.0, 60.0),
        Location::new(0.0, 0.0),
    ] {
        query.update_criteria(QueryCriteria::center(center)).unwrap();
    }
    assert_eq!(query.stats().in_query, 1);
    assert!(query.stats().stale_ranges > 0);

    let stats = query.sweep().unwrap();
    assert!(stats.ranges_retired > 0);
    assert_eq!(stats.entities_evicted, 0);
    assert_eq!(query.stats().stale_ranges, 0);
    assert_eq!(query.tracked_keys(), vec!["a".to_string()]);
}
