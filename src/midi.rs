//! MIDI utilities and message types
//!
//! Channel-message parsing for the traffic the device forwards, plus port
//! lookup and hex formatting used by the register transport.

use midir::{MidiIO, MidiInput, MidiOutput};
use std::fmt;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Control change number for "All Sound Off"
pub const CC_ALL_SOUND_OFF: u8 = 120;

/// MIDI message types relevant to the mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (1-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },

    /// Program Change: channel (0-15), program (0-127)
    ProgramChange { channel: u8, program: u8 },

    /// Pitch Bend: channel (0-15), value (0-16383, 14-bit)
    PitchBend { channel: u8, value: u16 },

    /// System Exclusive payload without the F0/F7 delimiters
    SysEx { data: Vec<u8> },

    /// Timing Clock
    TimingClock,

    Start,
    Continue,
    Stop,
}

impl MidiMessage {
    /// Parse a MIDI message from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&status, rest) = data.split_first()?;

        // Running status is not tracked
        if status < 0x80 {
            return None;
        }

        if status < 0xF0 {
            let channel = status & 0x0F;
            let d1 = rest.first().map(|b| b & 0x7F);
            let d2 = rest.get(1).map(|b| b & 0x7F);

            return match status & 0xF0 {
                0x80 => Some(MidiMessage::NoteOff { channel, note: d1?, velocity: d2? }),
                0x90 => {
                    let (note, velocity) = (d1?, d2?);
                    // Note On with velocity 0 is a Note Off
                    if velocity == 0 {
                        Some(MidiMessage::NoteOff { channel, note, velocity: 0 })
                    } else {
                        Some(MidiMessage::NoteOn { channel, note, velocity })
                    }
                }
                0xB0 => Some(MidiMessage::ControlChange { channel, cc: d1?, value: d2? }),
                0xC0 => Some(MidiMessage::ProgramChange { channel, program: d1? }),
                0xE0 => {
                    let value = ((d2? as u16) << 7) | d1? as u16;
                    Some(MidiMessage::PitchBend { channel, value })
                }
                _ => None,
            };
        }

        match status {
            0xF0 => {
                let end = data.iter().position(|&b| b == 0xF7)?;
                Some(MidiMessage::SysEx { data: data[1..end].to_vec() })
            }
            0xF8 => Some(MidiMessage::TimingClock),
            0xFA => Some(MidiMessage::Start),
            0xFB => Some(MidiMessage::Continue),
            0xFC => Some(MidiMessage::Stop),
            _ => None,
        }
    }

    /// Encode the message to MIDI bytes
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                vec![0xB0 | (channel & 0x0F), cc & 0x7F, value & 0x7F]
            }
            MidiMessage::ProgramChange { channel, program } => {
                vec![0xC0 | (channel & 0x0F), program & 0x7F]
            }
            MidiMessage::PitchBend { channel, value } => {
                vec![0xE0 | (channel & 0x0F), (value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
            }
            MidiMessage::SysEx { ref data } => {
                let mut out = Vec::with_capacity(data.len() + 2);
                out.push(0xF0);
                out.extend_from_slice(data);
                out.push(0xF7);
                out
            }
            MidiMessage::TimingClock => vec![0xF8],
            MidiMessage::Start => vec![0xFA],
            MidiMessage::Continue => vec![0xFB],
            MidiMessage::Stop => vec![0xFC],
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                write!(f, "NoteOff ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                write!(f, "NoteOn ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel + 1, cc, value)
            }
            MidiMessage::ProgramChange { channel, program } => {
                write!(f, "ProgramChange ch:{} p:{}", channel + 1, program)
            }
            MidiMessage::PitchBend { channel, value } => {
                write!(f, "PitchBend ch:{} v:{}", channel + 1, value)
            }
            MidiMessage::SysEx { ref data } => write!(f, "SysEx {} bytes", data.len()),
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Find a port by name: case-insensitive substring when `find` is set, exact otherwise
pub fn find_port<T: MidiIO>(io: &T, pattern: &str, find: bool) -> Result<(T::Port, String)> {
    let needle = pattern.to_lowercase();
    let mut available = Vec::new();

    for port in io.ports() {
        let Ok(name) = io.port_name(&port) else { continue };
        let hit = if find {
            name.to_lowercase().contains(&needle)
        } else {
            name == pattern
        };
        if hit {
            debug!("Found port '{}' matching pattern '{}'", name, pattern);
            return Ok((port, name));
        }
        available.push(name);
    }

    Err(SyncError::PortNotFound {
        pattern: pattern.to_string(),
        available: available.join(", "),
    })
}

/// Names of all MIDI (input, output) ports visible to the system
pub fn list_ports(client_name: &str) -> Result<(Vec<String>, Vec<String>)> {
    let midi_in = MidiInput::new(client_name)?;
    let midi_out = MidiOutput::new(client_name)?;
    Ok((port_names(&midi_in), port_names(&midi_out)))
}

fn port_names<T: MidiIO>(io: &T) -> Vec<String> {
    io.ports()
        .iter()
        .filter_map(|p| io.port_name(p).ok())
        .collect()
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
