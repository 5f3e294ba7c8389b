use geowatch::prelude::*;
use geowatch::{CallbackRegistration, KeyEvent};
use parking_lot::Mutex;
use std::sync::Arc;

type EventLog = Arc<Mutex<Vec<QueryEvent>>>;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup() -> (Arc<MemoryStore>, LocationStore) {
    init();
    let memory = Arc::new(MemoryStore::new());
    let locations = LocationStore::new(memory.clone());
    (memory, locations)
}

fn record(query: &GeoQuery, kinds: &[QueryEventKind]) -> (EventLog, Vec<CallbackRegistration>) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let registrations = kinds
        .iter()
        .map(|kind| {
            let log = log.clone();
            query.on(*kind, move |event| log.lock().push(event.clone()))
        })
        .collect();
    (log, registrations)
}

fn key_events(log: &EventLog) -> Vec<(QueryEventKind, String)> {
    log.lock()
        .iter()
        .filter_map(|event| event.key().map(|key| (event.kind(), key.to_string())))
        .collect()
}

/// Test 1: A key moving into the circle enters, and leaves when deleted
#[test]
fn test_fish_enters_then_exits_on_delete() {
    let (_, locations) = setup();
    let center = Location::new(-42.0, 148.0);

    locations
        .set("fish0", Location::new(-40.0, 159.0))
        .expect("Failed to set fish0");

    let query = locations
        .query(QueryCriteria::new(center, 600.0))
        .expect("Failed to create query");
    let (log, _registrations) = record(
        &query,
        &[
            QueryEventKind::KeyEntered,
            QueryEventKind::KeyExited,
            QueryEventKind::KeyMoved,
        ],
    );
    assert!(log.lock().is_empty(), "fish0 starts outside the query");

    let inside = Location::new(-40.0, 150.0);
    locations.set("fish0", inside).expect("Failed to move fish0");

    let expected_distance = distance(&inside, &center).unwrap();
    assert_eq!(
        log.lock().as_slice(),
        &[QueryEvent::KeyEntered(KeyEvent {
            key: "fish0".into(),
            location: Some(inside),
            distance: Some(expected_distance),
        })]
    );

    locations.remove("fish0").expect("Failed to remove fish0");
    assert_eq!(
        log.lock().last(),
        Some(&QueryEvent::KeyExited(KeyEvent {
            key: "fish0".into(),
            location: None,
            distance: None,
        }))
    );
    assert_eq!(log.lock().len(), 2);
    assert!(query.tracked_keys().is_empty());
}

/// Test 2: Every key_entered listener gets its own replay
#[test]
fn test_key_entered_replay_for_each_listener() {
    let (_, locations) = setup();
    locations
        .set_many([
            ("loc1", Some(Location::new(0.0, 0.0))),
            ("loc2", Some(Location::new(0.5, 0.5))),
            ("loc3", Some(Location::new(40.0, 40.0))),
        ])
        .unwrap();

    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))
        .unwrap();

    let (first, first_registrations) = record(&query, &[QueryEventKind::KeyEntered]);
    let (second, _second_registrations) = record(&query, &[QueryEventKind::KeyEntered]);

    let replayed = vec![
        (QueryEventKind::KeyEntered, "loc1".to_string()),
        (QueryEventKind::KeyEntered, "loc2".to_string()),
    ];
    assert_eq!(key_events(&first), replayed);
    assert_eq!(key_events(&second), replayed);

    first_registrations[0].cancel();
    locations.set("loc3", Location::new(0.2, 0.2)).unwrap();

    assert_eq!(key_events(&first).len(), 2);
    assert_eq!(
        key_events(&second).last(),
        Some(&(QueryEventKind::KeyEntered, "loc3".to_string()))
    );
}

/// Test 3: Moves inside the circle fire key_moved, not entered
#[test]
fn test_moves_within_query() {
    let (_, locations) = setup();
    locations.set("boat", Location::new(1.0, 1.0)).unwrap();

    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 1000.0))
        .unwrap();
    let (log, _registrations) = record(
        &query,
        &[
            QueryEventKind::KeyEntered,
            QueryEventKind::KeyExited,
            QueryEventKind::KeyMoved,
        ],
    );
    log.lock().clear();

    // crosses from the "s" cell into the "7" cell, both covered
    locations.set("boat", Location::new(-1.0, -1.0)).unwrap();
    // rewriting the same location is not a move
    locations.set("boat", Location::new(-1.0, -1.0)).unwrap();

    let events = log.lock().clone();
    assert_eq!(events.len(), 1, "{:?}", events);
    match &events[0] {
        QueryEvent::KeyMoved(event) => {
            assert_eq!(event.location, Some(Location::new(-1.0, -1.0)));
        }
        other => panic!("expected key_moved, got {:?}", other),
    }
    assert_eq!(query.tracked_keys(), vec!["boat".to_string()]);
}

/// Test 4: Moving out of the circle fires key_exited with the new location
#[test]
fn test_exit_carries_new_location() {
    let (_, locations) = setup();
    locations.set("car", Location::new(0.1, 0.1)).unwrap();

    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 50.0))
        .unwrap();
    let (log, _registrations) = record(&query, &[QueryEventKind::KeyExited]);

    let far = Location::new(45.0, 45.0);
    locations.set("car", far).unwrap();

    let events = log.lock().clone();
    assert_eq!(events.len(), 1);
    let exited = events[0].key_event().unwrap();
    assert_eq!(exited.location, Some(far));
    assert!(exited.distance.unwrap() > 50.0);
}

/// Test 5: Ready is replayed and refired on every criteria update
#[test]
fn test_ready_semantics() {
    let (_, locations) = setup();
    locations.set("loc1", Location::new(10.0, 10.0)).unwrap();

    let query = locations
        .query(QueryCriteria::new(Location::new(10.0, 10.0), 20.0))
        .unwrap();
    assert!(query.is_ready());

    let (log, _registrations) = record(
        &query,
        &[
            QueryEventKind::Ready,
            QueryEventKind::KeyEntered,
            QueryEventKind::KeyExited,
        ],
    );
    let count_ready = || {
        log.lock()
            .iter()
            .filter(|event| matches!(event, QueryEvent::Ready))
            .count()
    };
    assert_eq!(count_ready(), 1);
    log.lock().clear();

    // same criteria: no membership change, ready again
    query
        .update_criteria(QueryCriteria::new(Location::new(10.0, 10.0), 20.0))
        .unwrap();
    assert_eq!(log.lock().as_slice(), &[QueryEvent::Ready]);

    query
        .update_criteria(QueryCriteria::center(Location::new(-30.0, 100.0)))
        .unwrap();
    assert_eq!(
        key_events(&log),
        vec![(QueryEventKind::KeyExited, "loc1".to_string())]
    );
    assert_eq!(count_ready(), 2);
    assert_eq!(query.center(), Location::new(-30.0, 100.0));
    assert_eq!(query.radius(), 20.0);
}

/// Test 6: Criteria updates only fire entered and exited
#[test]
fn test_update_criteria_membership() {
    let (_, locations) = setup();
    locations
        .set_many([
            ("near", Some(Location::new(0.0, 0.5))),
            ("mid", Some(Location::new(0.0, 3.0))),
        ])
        .unwrap();

    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))
        .unwrap();
    let (log, _registrations) = record(
        &query,
        &[
            QueryEventKind::KeyEntered,
            QueryEventKind::KeyExited,
            QueryEventKind::KeyMoved,
        ],
    );
    log.lock().clear();

    query.update_criteria(QueryCriteria::radius(500.0)).unwrap();
    assert_eq!(
        key_events(&log),
        vec![(QueryEventKind::KeyEntered, "mid".to_string())]
    );

    log.lock().clear();
    query.update_criteria(QueryCriteria::radius(10.0)).unwrap();
    assert_eq!(
        key_events(&log),
        vec![
            (QueryEventKind::KeyExited, "mid".to_string()),
            (QueryEventKind::KeyExited, "near".to_string()),
        ]
    );

    // zero is a valid radius, not a missing one
    query.update_criteria(QueryCriteria::radius(0.0)).unwrap();
    assert_eq!(query.radius(), 0.0);
}

/// Test 7: A key never enters twice without exiting in between
#[test]
fn test_no_double_entry() {
    let (_, locations) = setup();
    let query = locations
        .query(QueryCriteria::new(Location::new(20.0, 20.0), 300.0))
        .unwrap();
    let (log, _registrations) = record(
        &query,
        &[QueryEventKind::KeyEntered, QueryEventKind::KeyExited],
    );

    let path = [
        Location::new(20.0, 20.0),
        Location::new(20.5, 20.5),
        Location::new(25.0, 25.0),
        Location::new(20.1, 19.9),
        Location::new(19.0, 21.0),
        Location::new(-20.0, 20.0),
        Location::new(20.0, 20.0),
    ];
    for location in path {
        locations.set("walker", location).unwrap();
    }
    query.update_criteria(QueryCriteria::radius(301.0)).unwrap();
    query
        .update_criteria(QueryCriteria::center(Location::new(21.0, 21.0)))
        .unwrap();
    locations.remove("walker").unwrap();

    let mut inside = false;
    for (kind, key) in key_events(&log) {
        assert_eq!(key, "walker");
        match kind {
            QueryEventKind::KeyEntered => {
                assert!(!inside, "entered twice");
                inside = true;
            }
            QueryEventKind::KeyExited => {
                assert!(inside, "exited while outside");
                inside = false;
            }
            _ => unreachable!(),
        }
    }
    assert!(!inside);
}

/// Test 8: Listeners may write to the store from inside a callback
#[test]
fn test_write_from_callback() {
    let (_, locations) = setup();
    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))
        .unwrap();
    let (log, _registrations) = record(&query, &[QueryEventKind::KeyEntered]);

    let writer = locations.clone();
    let _follow = query.on(QueryEventKind::KeyEntered, move |event| {
        if event.key() == Some("leader") {
            writer
                .set("follower", Location::new(0.2, 0.2))
                .expect("Failed to write from callback");
        }
    });

    locations.set("leader", Location::new(0.1, 0.1)).unwrap();

    let keys: Vec<String> = key_events(&log).into_iter().map(|(_, key)| key).collect();
    assert!(keys.contains(&"leader".to_string()));
    assert!(keys.contains(&"follower".to_string()));
}

/// Test 9: Cancel stops delivery and releases every subscription
#[test]
fn test_cancel_releases_subscriptions() {
    let (memory, locations) = setup();
    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))
        .unwrap();
    assert!(memory.stats().subscription_count > 0);

    let (log, _registrations) = record(&query, &[QueryEventKind::KeyEntered]);
    query.cancel();
    query.cancel();

    assert!(query.is_cancelled());
    assert_eq!(memory.stats().subscription_count, 0);

    locations.set("late", Location::new(0.0, 0.0)).unwrap();
    assert!(log.lock().is_empty());

    let registration = query.on(QueryEventKind::Ready, |_| panic!("must not fire"));
    assert!(registration.is_cancelled());
    assert!(matches!(
        query.update_criteria(QueryCriteria::radius(5.0)),
        Err(GeoError::Cancelled)
    ));
}

/// Test 10: Dropping the last handle cancels the query
#[test]
fn test_drop_cancels_query() {
    let (memory, locations) = setup();
    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 100.0))
        .unwrap();
    let clone = query.clone();

    drop(query);
    assert!(memory.stats().subscription_count > 0);
    assert!(!clone.is_cancelled());

    drop(clone);
    assert_eq!(memory.stats().subscription_count, 0);
}

/// Test 11: String event names resolve to kinds
#[test]
fn test_on_event_names() {
    let (_, locations) = setup();
    let query = locations
        .query(QueryCriteria::new(Location::new(0.0, 0.0), 1.0))
        .unwrap();

    assert!(query.on_event("key_moved", |_| {}).is_ok());
    let err = query.on_event("key_dance", |_| {}).unwrap_err();
    assert!(matches!(err, GeoError::UnknownEventType(ref name) if name == "key_dance"));
}
