//! Listener registry for a live query.

use crate::types::{QueryEvent, QueryEventKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Callback invoked for every event of the kind it was registered for.
pub type Callback = Arc<dyn Fn(&QueryEvent) + Send + Sync>;

/// Callbacks grouped by event kind, in registration order.
///
/// Ids are never reused, so a registration removed during a dispatch cannot be
/// confused with one added later.
#[derive(Default)]
pub(crate) struct Listeners {
    by_kind: [BTreeMap<u64, Callback>; 4],
    next_id: u64,
    closed: bool,
}

impl Listeners {
    fn slot(kind: QueryEventKind) -> usize {
        match kind {
            QueryEventKind::Ready => 0,
            QueryEventKind::KeyEntered => 1,
            QueryEventKind::KeyExited => 2,
            QueryEventKind::KeyMoved => 3,
        }
    }

    /// Returns the new id, or `None` once the registry is closed.
    pub fn add(&mut self, kind: QueryEventKind, callback: Callback) -> Option<u64> {
        if self.closed {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_kind[Self::slot(kind)].insert(id, callback);
        Some(id)
    }

    pub fn remove(&mut self, kind: QueryEventKind, id: u64) -> bool {
        self.by_kind[Self::slot(kind)].remove(&id).is_some()
    }

    pub fn contains(&self, kind: QueryEventKind, id: u64) -> bool {
        self.by_kind[Self::slot(kind)].contains_key(&id)
    }

    pub fn snapshot(&self, kind: QueryEventKind) -> Vec<(u64, Callback)> {
        self.by_kind[Self::slot(kind)]
            .iter()
            .map(|(id, callback)| (*id, callback.clone()))
            .collect()
    }

    /// Drops every callback and refuses new ones.
    pub fn close(&mut self) {
        self.closed = true;
        for callbacks in &mut self.by_kind {
            callbacks.clear();
        }
    }
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Handle returned by [`GeoQuery::on`](super::GeoQuery::on).
///
/// Cancelling is idempotent. Dropping the handle does not cancel the
/// registration.
pub struct CallbackRegistration {
    cancel: Mutex<Option<CancelFn>>,
}

impl CallbackRegistration {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A registration that was never attached, e.g. on a cancelled query.
    pub(crate) fn inert() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    /// Stops further deliveries to the callback.
    pub fn cancel(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_none()
    }
}

impl fmt::Debug for CallbackRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistration")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
