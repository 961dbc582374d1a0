//! Transports carrying property changes to and from the device
//!
//! Two implementations exist: the register-sync transport (SysEx register
//! reads and diff-writes over a MIDI port) and the message-bus transport
//! (address-keyed OSC messages over a length-prefixed TCP stream). The
//! device facade talks to either through the [`Transport`] trait and
//! receives inbound traffic through [`TransportSink`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, TransportKind};
use crate::error::Result;
use crate::property::{GroupAddress, PropertyChange, Value};

pub mod bus;
pub mod register;

pub use bus::BusTransport;
pub use register::RegisterTransport;

/// Connection lifecycle shared between the supervisor and the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Opening the channel or resynchronizing
    Connecting,
    /// Mirror matches the device; writes flow
    Synced,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Synced => write!(f, "synced"),
        }
    }
}

/// The flushed content of one outermost bundle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Changes in issue order
    pub changes: Vec<PropertyChange>,
    /// Groups (General or Layer) whose write must be a full, non-diffed push
    pub full_push: Vec<GroupAddress>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.full_push.is_empty()
    }

    /// Owning block addresses touched by this batch, in first-touch order
    pub fn touched_blocks(&self) -> Vec<GroupAddress> {
        let mut out: Vec<GroupAddress> = Vec::new();
        let owners = self
            .changes
            .iter()
            .map(|c| c.source.init_owner())
            .chain(self.full_push.iter().copied());
        for owner in owners {
            if !out.contains(&owner) {
                out.push(owner);
            }
        }
        out
    }
}

/// One value decoded from the device, addressed to a property group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    pub group: GroupAddress,
    pub name: String,
    pub value: Value,
}

impl RemoteValue {
    pub fn new(group: GroupAddress, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            group,
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Inbound side of a transport, implemented by the device facade
///
/// Transports call these from their reader and watchdog threads, never while
/// holding their own locks. The one exception is the silent load at the end
/// of a resync, which runs under the register mirror lock so that pushes
/// arriving meanwhile are applied after it.
pub trait TransportSink: Send + Sync {
    /// Apply values pushed by the device
    ///
    /// Values go through the validated setter with remote origin, so they are
    /// never echoed back out. With `notify` false the values are stored
    /// silently (used during a full resync, which ends with [`emit_all`]).
    ///
    /// [`emit_all`]: TransportSink::emit_all
    fn apply_remote(&self, values: Vec<RemoteValue>, notify: bool);

    /// Notify every listener of every current value, once
    fn emit_all(&self);

    /// Non-property traffic (notes, clock, foreign SysEx) for raw listeners
    fn raw_message(&self, bytes: &[u8]);
}

/// Transport trait - both device transports implement this
///
/// All methods take `&self`; implementations use interior mutability and are
/// shared between the caller's thread and their own background threads.
pub trait Transport: Send + Sync {
    /// Short name for logs ("register", "bus")
    fn name(&self) -> &'static str;

    /// Open the channel, resynchronize and start background threads
    ///
    /// Returns once the first attempt finished. A failed first attempt leaves
    /// the supervisor retrying in the background with the state `Connecting`.
    fn connect(&self, sink: Arc<dyn TransportSink>) -> Result<()>;

    /// Signal all owned threads to exit and join them within `timeout`
    fn disconnect(&self, timeout: Duration) -> Result<()>;

    /// Send one flushed bundle; dropped with a warning unless `Synced`
    fn write(&self, batch: &ChangeBatch);

    /// Announce a device initialization (full pushes follow via `ChangeBatch::full_push`)
    fn initialize(&self) {}

    /// Send non-property MIDI bytes to the device
    fn send_raw(&self, bytes: &[u8]);

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;
}

/// Build the transport selected by the configuration
pub fn from_config(config: &AppConfig) -> Box<dyn Transport> {
    match config.transport.kind {
        TransportKind::Register => Box::new(RegisterTransport::from_config(config)),
        TransportKind::Bus => Box::new(BusTransport::from_config(config)),
    }
}
