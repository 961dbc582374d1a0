//! Change listeners and raw-message listeners
//!
//! Listeners are called on the thread that caused the change (caller,
//! MIDI callback or watchdog) after every device lock has been released, so
//! they may read or write properties themselves.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::property::{GroupAddress, Value};

/// Handle returned by subscriptions, used to unsubscribe
pub type ListenerId = usize;

/// Where a change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A caller of `set`, a preset or a reset; flushed to the device
    Local,
    /// Decoded from the device or the bus; never sent back
    Remote,
}

/// A stored value that actually changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEvent {
    pub group: GroupAddress,
    pub name: String,
    pub value: Value,
    pub origin: Origin,
}

type PropertyFn = Arc<dyn Fn(&PropertyEvent) + Send + Sync>;
type RawFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
pub(super) struct Listeners {
    next_id: AtomicUsize,
    property: RwLock<Vec<(ListenerId, Option<GroupAddress>, PropertyFn)>>,
    raw: RwLock<Vec<(ListenerId, RawFn)>>,
}

impl Listeners {
    fn next_id(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Listen to one group, or to every group when `group` is None
    pub(super) fn subscribe(&self, group: Option<GroupAddress>, f: PropertyFn) -> ListenerId {
        let id = self.next_id();
        self.property.write().push((id, group, f));
        id
    }

    pub(super) fn subscribe_raw(&self, f: RawFn) -> ListenerId {
        let id = self.next_id();
        self.raw.write().push((id, f));
        id
    }

    pub(super) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut property = self.property.write();
        let before = property.len();
        property.retain(|(i, _, _)| *i != id);
        if property.len() != before {
            return true;
        }
        drop(property);

        let mut raw = self.raw.write();
        let before = raw.len();
        raw.retain(|(i, _)| *i != id);
        raw.len() != before
    }

    pub(super) fn notify(&self, events: &[PropertyEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.property.read().clone();
        for event in events {
            for (_, filter, f) in &listeners {
                if filter.map_or(true, |g| g == event.group) {
                    f(event);
                }
            }
        }
    }

    pub(super) fn raw(&self, bytes: &[u8]) {
        let listeners = self.raw.read().clone();
        for (_, f) in &listeners {
            f(bytes);
        }
    }
}
