//! MIDI link used by the register transport
//!
//! The transport only needs "send bytes" plus a callback for inbound bytes;
//! the opener trait lets tests swap the midir ports for an in-process device.

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::info;

use crate::config::RegisterPortConfig;
use crate::error::{Result, SyncError};
use crate::midi::find_port;

/// Callback invoked on the driver's thread for every inbound message
pub type InboundCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// An open bidirectional MIDI channel; dropping it closes the ports
pub trait MidiLink: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Opens links to the device
pub trait LinkOpener: Send + Sync {
    fn open(&self, on_message: InboundCallback) -> Result<Box<dyn MidiLink>>;
}

/// Opens midir input/output ports by name
pub struct MidirOpener {
    port: RegisterPortConfig,
}

impl MidirOpener {
    pub fn new(port: RegisterPortConfig) -> Self {
        Self { port }
    }
}

struct MidirLink {
    output: MidiOutputConnection,
    _input: MidiInputConnection<()>,
}

impl MidiLink for MidirLink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.send(bytes)?;
        Ok(())
    }
}

impl LinkOpener for MidirOpener {
    fn open(&self, mut on_message: InboundCallback) -> Result<Box<dyn MidiLink>> {
        let cfg = &self.port;

        let mut midi_in = MidiInput::new(&format!("{}-in", cfg.client_name))?;
        // SysEx carries the protocol, timing carries the clock
        midi_in.ignore(Ignore::None);
        let (in_port, in_name) = find_port(&midi_in, &cfg.port_name, cfg.find)?;

        let midi_out = MidiOutput::new(&format!("{}-out", cfg.client_name))?;
        let (out_port, out_name) = find_port(&midi_out, &cfg.port_name, cfg.find)?;

        let input = midi_in
            .connect(
                &in_port,
                &cfg.client_name,
                move |_timestamp, data, _| on_message(data),
                (),
            )
            .map_err(|e| SyncError::Midi(format!("input '{}': {}", in_name, e)))?;

        let output = midi_out
            .connect(&out_port, &cfg.client_name)
            .map_err(|e| SyncError::Midi(format!("output '{}': {}", out_name, e)))?;

        info!("Midibox using {} / {} ({})", in_name, out_name, cfg.client_name);

        Ok(Box::new(MidirLink {
            output,
            _input: input,
        }))
    }
}
