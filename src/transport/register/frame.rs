//! SysEx frame codec for the register protocol
//!
//! `F0 <sysex_id> <cmd<<4 | group> <offset> <len> <data...> F7`

use crate::config::{CommandCodes, ProtocolConfig};
use crate::error::{Result, SyncError};

/// Decoded protocol command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Info,
    Update,
    ReadRequest,
    ReadResponse,
    WriteRequest,
    WriteAck,
    WriteNak,
    Unknown(u8),
}

/// One register protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Group index: 0-7 layers, `general_index` for General
    pub group: u8,
    pub offset: u8,
    /// Declared length; equals `data.len()` except for read requests
    pub len: u8,
    pub data: Vec<u8>,
}

/// Encoder/decoder bound to one protocol configuration
#[derive(Debug, Clone)]
pub struct FrameCodec {
    sysex_id: u8,
    commands: CommandCodes,
}

impl FrameCodec {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            sysex_id: protocol.sysex_id,
            commands: protocol.commands,
        }
    }

    fn code(&self, command: Command) -> u8 {
        let c = &self.commands;
        match command {
            Command::Info => c.info,
            Command::Update => c.update,
            Command::ReadRequest => c.read_request,
            Command::ReadResponse => c.read_response,
            Command::WriteRequest => c.write_request,
            Command::WriteAck => c.write_ack,
            Command::WriteNak => c.write_nak,
            Command::Unknown(code) => code,
        }
    }

    fn command(&self, code: u8) -> Command {
        let c = &self.commands;
        [
            (c.info, Command::Info),
            (c.update, Command::Update),
            (c.read_request, Command::ReadRequest),
            (c.read_response, Command::ReadResponse),
            (c.write_request, Command::WriteRequest),
            (c.write_ack, Command::WriteAck),
            (c.write_nak, Command::WriteNak),
        ]
        .into_iter()
        .find(|(k, _)| *k == code)
        .map(|(_, cmd)| cmd)
        .unwrap_or(Command::Unknown(code))
    }

    /// Encode a frame into SysEx bytes
    pub fn encode(&self, frame: &Frame) -> Vec<u8> {
        let address = ((self.code(frame.command) & 0x07) << 4) | (frame.group & 0x0F);
        let mut out = Vec::with_capacity(frame.data.len() + 6);
        out.extend_from_slice(&[0xF0, self.sysex_id, address, frame.offset, frame.len]);
        out.extend(frame.data.iter().map(|b| b & 0x7F));
        out.push(0xF7);
        out
    }

    pub fn read_request(&self, group: u8, offset: u8, len: u8) -> Vec<u8> {
        self.encode(&Frame {
            command: Command::ReadRequest,
            group,
            offset,
            len,
            data: Vec::new(),
        })
    }

    pub fn write_request(&self, group: u8, offset: u8, data: &[u8]) -> Vec<u8> {
        self.encode(&Frame {
            command: Command::WriteRequest,
            group,
            offset,
            len: data.len() as u8,
            data: data.to_vec(),
        })
    }

    /// Decode inbound bytes
    ///
    /// Returns `Ok(None)` for MIDI that is not a frame of this protocol
    /// (other messages, foreign SysEx ids) and `MalformedFrame` for frames
    /// carrying our id that do not parse.
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<Frame>> {
        if bytes.len() < 2 || bytes[0] != 0xF0 || bytes[1] != self.sysex_id {
            return Ok(None);
        }

        let body = match bytes.last() {
            Some(0xF7) => &bytes[2..bytes.len() - 1],
            _ => return Err(SyncError::MalformedFrame("missing end of exclusive".into())),
        };

        if body.len() < 3 {
            return Err(SyncError::MalformedFrame(format!(
                "header too short ({} bytes)",
                body.len()
            )));
        }

        let (address, offset, len) = (body[0], body[1], body[2]);
        let command = self.command((address >> 4) & 0x07);
        let data = &body[3..];

        if command != Command::ReadRequest && data.len() != len as usize {
            return Err(SyncError::MalformedFrame(format!(
                "declared length {} but {} data bytes",
                len,
                data.len()
            )));
        }

        Ok(Some(Frame {
            command,
            group: address & 0x0F,
            offset,
            len,
            data: data.to_vec(),
        }))
    }
}
