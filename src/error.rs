//! Error types for the sync engine
//!
//! Transport failures are absorbed by the reconnection supervisor; these
//! errors only surface from `connect`/`disconnect`, configuration and the
//! internals of the transports.

use thiserror::Error;

/// Errors raised by the property mirror and its transports
#[derive(Debug, Error)]
pub enum SyncError {
    /// The MIDI endpoint could not be found among the available ports
    #[error("port '{pattern}' not found in: {available}")]
    PortNotFound { pattern: String, available: String },

    /// No matching response arrived for one read attempt
    #[error("no response for read of block {block} at {offset}+{len}")]
    ReadTimeout { block: u8, offset: u8, len: u8 },

    /// Retries exhausted or the channel went stale
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Operation needs an open channel
    #[error("not connected")]
    NotConnected,

    /// `connect` called on a transport that is already running
    #[error("transport already connected")]
    AlreadyConnected,

    /// Inbound bytes that do not parse as a protocol frame
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Property lookup by name failed
    #[error("unknown property '{name}' in {group}")]
    UnknownProperty { group: String, name: String },

    /// Underlying MIDI driver error
    #[error("MIDI error: {0}")]
    Midi(String),

    /// OSC encode/decode error on the message bus
    #[error("OSC error: {0}")]
    Osc(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<midir::InitError> for SyncError {
    fn from(e: midir::InitError) -> Self {
        SyncError::Midi(e.to_string())
    }
}

impl From<midir::SendError> for SyncError {
    fn from(e: midir::SendError) -> Self {
        SyncError::Midi(e.to_string())
    }
}

impl From<rosc::OscError> for SyncError {
    fn from(e: rosc::OscError) -> Self {
        SyncError::Osc(format!("{:?}", e))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
