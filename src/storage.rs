//! Store abstraction consumed by the query engine.
//!
//! The engine needs four capabilities from the backing key/value store:
//! watch a range of an indexed field, stop watching it, read a single key, and
//! atomically write several keys. Transport, persistence and authentication
//! stay behind this trait.

use crate::error::StoreResult;
use crate::types::RangeQuery;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

mod memory;
pub mod record;

pub use memory::{MemoryStore, StoreStats};
pub use record::{INDEX_FIELD, PRIORITY_FIELD, decode_record, encode_record};

/// Notification for a watched range.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeEvent {
    /// A record entered the range, or existed when the subscription started.
    Added { key: String, value: Value },
    /// A record inside the range was rewritten and is still inside it.
    Changed { key: String, value: Value },
    /// A record left the range or was deleted.
    Removed { key: String },
    /// Every record that matched when the subscription started has been
    /// delivered as `Added`. Sent once per subscription.
    Settled,
}

/// Receiver of range notifications.
pub type RangeSink = Arc<dyn Fn(RangeEvent) + Send + Sync>;

/// Opaque handle for an active range subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Trait for event-streaming key/value stores.
///
/// Implementations must deliver, per subscription, all pre-existing matches
/// as [`RangeEvent::Added`] before [`RangeEvent::Settled`], and must not hold
/// internal locks while invoking a sink: sinks read from the store and may
/// write to it from inside listener callbacks.
pub trait GeoStore: Send + Sync {
    /// Watch records whose `field` value lies in `range` (half-open).
    fn subscribe_range(
        &self,
        field: &str,
        range: &RangeQuery,
        sink: RangeSink,
    ) -> StoreResult<SubscriptionHandle>;

    /// Stop a subscription. Unknown handles are ignored.
    fn unsubscribe_range(&self, handle: SubscriptionHandle) -> StoreResult<()>;

    /// Read a single record without subscribing.
    fn read(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Apply all updates atomically. `None` deletes the key.
    fn write_many(&self, updates: BTreeMap<String, Option<Value>>) -> StoreResult<()>;

    fn write(&self, key: &str, value: Option<Value>) -> StoreResult<()> {
        let mut updates = BTreeMap::new();
        updates.insert(key.to_string(), value);
        self.write_many(updates)
    }
}
