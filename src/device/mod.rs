//! Device facade
//!
//! Owns the fixed set of property groups (General, 8 Layers, 8 Pedals per
//! layer) and exactly one transport. Local writes go through a device-wide
//! bundle; closing the outermost scope flushes the accumulated changes to the
//! transport as one [`ChangeBatch`]. Inbound values arrive through the
//! [`TransportSink`] implementation and are applied with remote origin, which
//! notifies listeners but never queues an outbound write.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::midi::{MidiMessage, CC_ALL_SOUND_OFF};
use crate::property::{GroupAddress, PropertyChange, PropertyGroup, Value, LAYERS, PEDALS};
use crate::transport::{self, ChangeBatch, ConnectionState, RemoteValue, Transport, TransportSink};

mod listeners;
mod preset;
mod transaction;

pub use listeners::{ListenerId, Origin, PropertyEvent};
pub use preset::{LayerPreset, Preset, PresetMap};
pub use transaction::BundleGuard;

use listeners::Listeners;
use transaction::Transaction;

#[cfg(test)]
mod tests;

/// Range bound targeted by a key capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBound {
    Lower,
    Upper,
}

impl KeyBound {
    fn property(self) -> &'static str {
        match self {
            KeyBound::Lower => "rangel",
            KeyBound::Upper => "rangeu",
        }
    }
}

impl std::str::FromStr for KeyBound {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rangel" => Ok(KeyBound::Lower),
            "rangeu" => Ok(KeyBound::Upper),
            other => Err(SyncError::UnknownProperty {
                group: "key capture".into(),
                name: other.into(),
            }),
        }
    }
}

struct DeviceState {
    groups: BTreeMap<GroupAddress, PropertyGroup>,
    tx: Transaction,
}

impl DeviceState {
    fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(GroupAddress::General, PropertyGroup::new(GroupAddress::General));
        for l in 0..LAYERS {
            groups.insert(GroupAddress::Layer(l), PropertyGroup::new(GroupAddress::Layer(l)));
            for p in 0..PEDALS {
                groups.insert(GroupAddress::Pedal(l, p), PropertyGroup::new(GroupAddress::Pedal(l, p)));
            }
        }
        Self {
            groups,
            tx: Transaction::default(),
        }
    }

    /// Full-push owners for this flush; their `pending_init` flags are consumed
    fn take_full_push(&mut self, changes: &[PropertyChange]) -> Vec<GroupAddress> {
        let mut out = Vec::new();
        for change in changes {
            let owner = change.source.init_owner();
            if out.contains(&owner) {
                continue;
            }
            if let Some(group) = self.groups.get_mut(&owner) {
                if group.pending_init {
                    group.pending_init = false;
                    out.push(owner);
                }
            }
        }
        out
    }
}

pub(crate) struct DeviceInner {
    state: Mutex<DeviceState>,
    /// Held from batch hand-off until `Transport::write` returns, so flushes
    /// reach the transport in scope-close order
    flush: Mutex<()>,
    listeners: Listeners,
    key_request: Mutex<Option<(usize, KeyBound)>>,
    transport: Box<dyn Transport>,
}

impl DeviceInner {
    pub(super) fn enter_scope(&self) {
        self.state.lock().tx.enter();
    }

    pub(super) fn exit_scope(&self) {
        let mut state = self.state.lock();
        let Some(changes) = state.tx.exit() else {
            return;
        };
        let full_push = state.take_full_push(&changes);
        let batch = ChangeBatch { changes, full_push };

        let _flush = self.flush.lock();
        drop(state);
        debug!(
            "Flushing {} change(s) to {} transport ({} full push)",
            batch.changes.len(),
            self.transport.name(),
            batch.full_push.len()
        );
        self.transport.write(&batch);
    }

    /// Validated local write; the caller holds a bundle scope
    fn set_local(&self, group: GroupAddress, name: &str, value: &Value) -> Option<Value> {
        let mut state = self.state.lock();
        let Some(target) = state.groups.get_mut(&group) else {
            warn!("Ignoring write to unknown group {}", group);
            return None;
        };
        if !target.contains(name) {
            warn!("Ignoring write to unknown property '{}' in {}", name, group);
            return None;
        }
        let stored = target.set(name, value)?;
        state.tx.record(PropertyChange {
            source: group,
            name: name.to_string(),
            value: stored.clone(),
        });
        drop(state);

        self.listeners.notify(&[PropertyEvent {
            group,
            name: name.to_string(),
            value: stored.clone(),
            origin: Origin::Local,
        }]);
        Some(stored)
    }

    fn reset_group(&self, group: GroupAddress) -> usize {
        let mut state = self.state.lock();
        let Some(target) = state.groups.get_mut(&group) else {
            return 0;
        };
        let changed = target.reset();
        let mut events = Vec::with_capacity(changed.len());
        for (name, value) in changed {
            state.tx.record(PropertyChange {
                source: group,
                name: name.clone(),
                value: value.clone(),
            });
            events.push(PropertyEvent {
                group,
                name,
                value,
                origin: Origin::Local,
            });
        }
        drop(state);

        self.listeners.notify(&events);
        events.len()
    }

    fn snapshot_events(&self) -> Vec<PropertyEvent> {
        let state = self.state.lock();
        state
            .groups
            .iter()
            .flat_map(|(address, group)| {
                group.iter().map(move |(name, value)| PropertyEvent {
                    group: *address,
                    name: name.to_string(),
                    value: value.clone(),
                    origin: Origin::Remote,
                })
            })
            .collect()
    }
}

impl TransportSink for DeviceInner {
    fn apply_remote(&self, values: Vec<RemoteValue>, notify: bool) {
        let mut by_group: Vec<(GroupAddress, Vec<(String, Value)>)> = Vec::new();
        for v in values {
            match by_group.iter_mut().find(|(g, _)| *g == v.group) {
                Some((_, list)) => list.push((v.name, v.value)),
                None => by_group.push((v.group, vec![(v.name, v.value)])),
            }
        }

        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            for (address, list) in by_group {
                let Some(group) = state.groups.get_mut(&address) else {
                    debug!("Dropping remote values for unknown group {}", address);
                    continue;
                };
                for (name, value) in group.set_all(list) {
                    events.push(PropertyEvent {
                        group: address,
                        name,
                        value,
                        origin: Origin::Remote,
                    });
                }
            }
        }

        if notify {
            self.listeners.notify(&events);
        }
    }

    fn emit_all(&self) {
        let events = self.snapshot_events();
        debug!("Emitting {} property values", events.len());
        self.listeners.notify(&events);
    }

    fn raw_message(&self, bytes: &[u8]) {
        if let Some(MidiMessage::NoteOn { note, .. }) = MidiMessage::parse(bytes) {
            let armed = self.key_request.lock().take();
            if let Some((layer, bound)) = armed {
                info!("Captured key {} for layer {} {}", note, layer, bound.property());
                let _scope = BundleGuard::open(self);
                self.set_local(GroupAddress::Layer(layer), bound.property(), &Value::Int(note.into()));
            }
        }
        self.listeners.raw(bytes);
    }
}

/// Mirror of one Midibox and its transport
pub struct Device {
    inner: Arc<DeviceInner>,
    join_timeout: Duration,
}

impl Device {
    /// Create a device around an already-built transport
    pub fn new(transport: Box<dyn Transport>, join_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                state: Mutex::new(DeviceState::new()),
                flush: Mutex::new(()),
                listeners: Listeners::default(),
                key_request: Mutex::new(None),
                transport,
            }),
            join_timeout,
        }
    }

    /// Create a device with the transport selected by `config`
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(transport::from_config(config), config.timing.join_timeout())
    }

    /// Open the transport and resynchronize
    ///
    /// A failed first attempt is not an error: the transport keeps retrying in
    /// the background and reports `Connecting` until it succeeds.
    pub fn connect(&self) -> Result<()> {
        info!("Connecting via {} transport", self.inner.transport.name());
        let sink: Arc<dyn TransportSink> = self.inner.clone();
        self.inner.transport.connect(sink)?;
        info!("Transport state: {}", self.inner.transport.connection_state());
        Ok(())
    }

    /// Stop the transport and join its threads within the configured timeout
    pub fn disconnect(&self) -> Result<()> {
        self.inner.transport.disconnect(self.join_timeout)?;
        info!("Disconnected");
        Ok(())
    }

    /// Force the next write of General and every Layer to be a full push
    pub fn initialize(&self) {
        {
            let mut state = self.inner.state.lock();
            for (address, group) in state.groups.iter_mut() {
                if !matches!(address, GroupAddress::Pedal(..)) {
                    group.pending_init = true;
                }
            }
        }
        self.inner.transport.initialize();
        info!("Device initialization requested");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.connection_state()
    }

    /// Stored value, or None for an unknown group or name
    pub fn get(&self, group: GroupAddress, name: &str) -> Option<Value> {
        self.inner.state.lock().groups.get(&group)?.get(name).cloned()
    }

    /// Validated write; returns the stored value when it changed
    ///
    /// Unknown names are logged and ignored. Outside a bundle the change is
    /// flushed immediately.
    pub fn set(&self, group: GroupAddress, name: &str, value: impl Into<Value>) -> Option<Value> {
        let _scope = self.bundle();
        self.inner.set_local(group, name, &value.into())
    }

    /// Open a bundle scope; the outermost scope flushes when dropped
    pub fn bundle(&self) -> BundleGuard<'_> {
        BundleGuard::open(&self.inner)
    }

    /// Run `f` inside one bundle
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        let _scope = self.bundle();
        f(self)
    }

    /// Listen to changes of one group
    pub fn subscribe<F>(&self, group: GroupAddress, listener: F) -> ListenerId
    where
        F: Fn(&PropertyEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(Some(group), Arc::new(listener))
    }

    /// Listen to changes of every group
    pub fn subscribe_all<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PropertyEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(None, Arc::new(listener))
    }

    /// Receive non-property MIDI traffic (notes, clock, foreign SysEx)
    pub fn forward_raw<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe_raw(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Send non-property MIDI bytes to the device
    pub fn send_raw(&self, bytes: &[u8]) {
        self.inner.transport.send_raw(bytes);
    }

    /// Notify every listener of every current value
    pub fn emit_all(&self) {
        self.inner.emit_all();
    }

    /// Apply a preset map inside one bundle; returns the number of changed values
    pub fn apply_preset(&self, preset: &PresetMap) -> usize {
        let _scope = self.bundle();
        let mut changed = 0;
        let mut apply = |group: GroupAddress, values: &BTreeMap<String, Value>| {
            for (name, value) in values {
                if self.inner.set_local(group, name, value).is_some() {
                    changed += 1;
                }
            }
        };

        apply(GroupAddress::General, &preset.general);
        for (&l, layer) in &preset.layers {
            if l >= LAYERS {
                warn!("Skipping preset values for layer {}", l);
                continue;
            }
            apply(GroupAddress::Layer(l), &layer.props);
            for (&p, pedal) in &layer.pedals {
                if p >= PEDALS {
                    warn!("Skipping preset values for layer {} pedal {}", l, p);
                    continue;
                }
                apply(GroupAddress::Pedal(l, p), pedal);
            }
        }
        debug!("Preset applied with {} change(s)", changed);
        changed
    }

    /// Restore a layer and its pedals to defaults inside one bundle
    pub fn reset_layer(&self, layer: usize) -> usize {
        if layer >= LAYERS {
            warn!("Ignoring reset of layer {}", layer);
            return 0;
        }
        let _scope = self.bundle();
        let mut changed = self.inner.reset_group(GroupAddress::Layer(layer));
        for p in 0..PEDALS {
            changed += self.inner.reset_group(GroupAddress::Pedal(layer, p));
        }
        changed
    }

    /// CC 120 (all sound off) on the channel of every layer
    pub fn all_sounds_off(&self) {
        for channel in 0..LAYERS as u8 {
            let msg = MidiMessage::ControlChange {
                channel,
                cc: CC_ALL_SOUND_OFF,
                value: 0,
            };
            self.inner.transport.send_raw(&msg.encode());
        }
    }

    /// Set a layer range bound from the next Note On received from the device
    pub fn request_key(&self, layer: usize, bound: KeyBound) {
        if layer >= LAYERS {
            warn!("Ignoring key capture for layer {}", layer);
            return;
        }
        *self.inner.key_request.lock() = Some((layer, bound));
        info!("Waiting for a key for layer {} {}", layer, bound.property());
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.inner.transport.connection_state() != ConnectionState::Disconnected {
            if let Err(e) = self.inner.transport.disconnect(self.join_timeout) {
                warn!("Disconnect on drop failed: {}", e);
            }
        }
    }
}
