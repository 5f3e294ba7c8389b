//! In-process store with range subscriptions.
//!
//! Records are JSON documents in a `BTreeMap`. Every write is compared against
//! the open subscriptions and turned into added/changed/removed notifications,
//! which are delivered after the internal lock is released.
//!
//! Deliveries are serialized in write order across threads. A write made from
//! inside a sink on the delivering thread is delivered immediately, ahead of
//! the rest of the batch that triggered it.

use super::{GeoStore, RangeEvent, RangeSink, SubscriptionHandle};
use crate::error::{StoreError, StoreResult};
use crate::types::RangeQuery;
use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeMap;

/// Memory store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub record_count: usize,
    pub subscription_count: usize,
    pub writes: u64,
    pub events_delivered: u64,
}

struct Subscription {
    field: String,
    range: RangeQuery,
    sink: RangeSink,
}

impl Subscription {
    fn matches(&self, value: Option<&Value>) -> bool {
        value
            .and_then(|v| v.get(&self.field))
            .and_then(Value::as_str)
            .is_some_and(|index| self.range.contains(index))
    }
}

#[derive(Default)]
struct MemoryInner {
    data: BTreeMap<String, Value>,
    subscriptions: FxHashMap<u64, Subscription>,
    next_subscription: u64,
    stats: StoreStats,
    closed: bool,
}

/// In-memory [`GeoStore`].
///
/// ```rust
/// use geowatch::storage::{GeoStore, MemoryStore};
/// use serde_json::json;
///
/// let store = MemoryStore::new();
/// store.write("fish0", Some(json!({ "g": "7zzzzzzzzz", "l": [0, 0] })))?;
/// assert!(store.read("fish0")?.is_some());
/// # Ok::<(), geowatch::StoreError>(())
/// ```
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    /// Held from the moment a write is applied until its events are delivered.
    delivery: ReentrantMutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }

    /// Copy of every record, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner.lock().data.clone()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            record_count: inner.data.len(),
            subscription_count: inner.subscriptions.len(),
            ..inner.stats.clone()
        }
    }

    /// Drops every subscription and rejects further calls.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscriptions.clear();
    }

    fn deliver(&self, events: Vec<(RangeSink, RangeEvent)>) {
        if events.is_empty() {
            return;
        }
        self.inner.lock().stats.events_delivered += events.len() as u64;
        for (sink, event) in events {
            sink(event);
        }
    }
}

impl GeoStore for MemoryStore {
    fn subscribe_range(
        &self,
        field: &str,
        range: &RangeQuery,
        sink: RangeSink,
    ) -> StoreResult<SubscriptionHandle> {
        let _delivery = self.delivery.lock();
        let (handle, events) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(StoreError::Closed);
            }

            let subscription = Subscription {
                field: field.to_string(),
                range: range.clone(),
                sink: sink.clone(),
            };

            let mut initial: Vec<(&str, &String, &Value)> = inner
                .data
                .iter()
                .filter_map(|(key, value)| {
                    value
                        .get(field)
                        .and_then(Value::as_str)
                        .filter(|index| range.contains(index))
                        .map(|index| (index, key, value))
                })
                .collect();
            // delivered in index order, ties broken by key
            initial.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

            let mut events: Vec<(RangeSink, RangeEvent)> = initial
                .into_iter()
                .map(|(_, key, value)| {
                    (
                        sink.clone(),
                        RangeEvent::Added {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    )
                })
                .collect();
            events.push((sink, RangeEvent::Settled));

            let id = inner.next_subscription;
            inner.next_subscription += 1;
            inner.subscriptions.insert(id, subscription);

            log::debug!("memory store: subscribed {} on {} as #{}", range, field, id);
            (SubscriptionHandle::new(id), events)
        };

        self.deliver(events);
        Ok(handle)
    }

    fn unsubscribe_range(&self, handle: SubscriptionHandle) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.subscriptions.remove(&handle.id()).is_some() {
            log::debug!("memory store: unsubscribed #{}", handle.id());
        }
        Ok(())
    }

    fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        Ok(inner.data.get(key).cloned())
    }

    fn write_many(&self, updates: BTreeMap<String, Option<Value>>) -> StoreResult<()> {
        let _delivery = self.delivery.lock();
        let events = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(StoreError::Closed);
            }

            let mut events = Vec::new();
            for (key, new_value) in updates {
                let old_value = match &new_value {
                    Some(value) => inner.data.insert(key.clone(), value.clone()),
                    None => inner.data.remove(&key),
                };
                if old_value == new_value {
                    continue;
                }

                for subscription in inner.subscriptions.values() {
                    let was_in = subscription.matches(old_value.as_ref());
                    let is_in = subscription.matches(new_value.as_ref());
                    let event = match (was_in, &new_value) {
                        (false, Some(value)) if is_in => RangeEvent::Added {
                            key: key.clone(),
                            value: value.clone(),
                        },
                        (true, Some(value)) if is_in => RangeEvent::Changed {
                            key: key.clone(),
                            value: value.clone(),
                        },
                        (true, _) => RangeEvent::Removed { key: key.clone() },
                        _ => continue,
                    };
                    events.push((subscription.sink.clone(), event));
                }
            }

            inner.stats.writes += 1;
            events
        };

        self.deliver(events);
        Ok(())
    }
}
