//! Bundles: coalescing property writes into one flush
//!
//! The depth counter is device-wide. Entering at depth 0 starts a fresh
//! change list; only the transition back to depth 0 yields the list for
//! flushing, so nested scopes never flush twice.

use crate::property::PropertyChange;

use super::DeviceInner;

#[derive(Debug, Default)]
pub(super) struct Transaction {
    depth: usize,
    changes: Vec<PropertyChange>,
}

impl Transaction {
    pub(super) fn enter(&mut self) {
        if self.depth == 0 {
            self.changes.clear();
        }
        self.depth += 1;
    }

    pub(super) fn record(&mut self, change: PropertyChange) {
        self.changes.push(change);
    }

    /// Leave one level; the accumulated changes when the outermost scope closes
    pub(super) fn exit(&mut self) -> Option<Vec<PropertyChange>> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 && !self.changes.is_empty() {
            Some(std::mem::take(&mut self.changes))
        } else {
            None
        }
    }

    pub(super) fn depth(&self) -> usize {
        self.depth
    }
}

/// An open bundle scope; closing the outermost one flushes to the transport
#[must_use = "the bundle closes when the guard is dropped"]
pub struct BundleGuard<'a> {
    device: &'a DeviceInner,
}

impl<'a> BundleGuard<'a> {
    pub(super) fn open(device: &'a DeviceInner) -> Self {
        device.enter_scope();
        Self { device }
    }
}

impl Drop for BundleGuard<'_> {
    fn drop(&mut self) {
        self.device.exit_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{GroupAddress, Value};

    fn change(n: i64) -> PropertyChange {
        PropertyChange {
            source: GroupAddress::Layer(0),
            name: "volume".into(),
            value: Value::Int(n),
        }
    }

    #[test]
    fn test_nested_scopes_flush_once_in_order() {
        let mut tx = Transaction::default();
        tx.enter();
        tx.record(change(1));
        tx.enter();
        tx.record(change(2));
        assert_eq!(tx.exit(), None);
        tx.record(change(3));

        let flushed = tx.exit().unwrap();
        assert_eq!(flushed, vec![change(1), change(2), change(3)]);
        assert_eq!(tx.depth(), 0);
    }

    #[test]
    fn test_empty_scope_flushes_nothing() {
        let mut tx = Transaction::default();
        tx.enter();
        assert_eq!(tx.exit(), None);
        assert_eq!(tx.exit(), None);
        assert_eq!(tx.depth(), 0);
    }
}
