//! Midibox Sync
//!
//! Mirrors the configuration of a MIDI-attached Midibox layer controller as
//! typed, validated, observable properties and keeps the mirror consistent
//! with the device over either the SysEx register protocol or the OSC
//! message bus.

pub mod config;
pub mod device;
pub mod error;
pub mod midi;
pub mod property;
pub mod transport;

pub use config::AppConfig;
pub use device::{Device, KeyBound, Origin, PresetMap, PropertyEvent};
pub use error::{Result, SyncError};
pub use property::{GroupAddress, Value};
pub use transport::{ConnectionState, Transport};
