//! Address scheme and OSC framing for the message bus
//!
//! Addresses: `<prefix>/general/<name>`, `<prefix>/layers/<i>/<name>` and
//! `<prefix>/layers/<i>/pedal<n>.<name>`. Raw MIDI travels as a blob on
//! `<prefix>/midi`. Each transaction is one OSC bundle behind a 4-byte
//! length prefix.

use rosc::{decoder, encoder, OscBundle, OscMessage, OscPacket, OscTime, OscType};

use crate::config::ByteOrder;
use crate::error::{Result, SyncError};
use crate::property::{GroupAddress, PropertyChange, Value, LAYERS, PEDALS};

/// What an inbound address refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Property(GroupAddress, String),
    Midi,
    Initialize,
}

/// Bus address of a property
pub fn address(prefix: &str, group: GroupAddress, name: &str) -> String {
    match group {
        GroupAddress::General => format!("{}/general/{}", prefix, name),
        GroupAddress::Layer(l) => format!("{}/layers/{}/{}", prefix, l, name),
        GroupAddress::Pedal(l, p) => format!("{}/layers/{}/pedal{}.{}", prefix, l, p, name),
    }
}

pub fn midi_address(prefix: &str) -> String {
    format!("{}/midi", prefix)
}

pub fn initialize_address(prefix: &str) -> String {
    format!("{}/initialize", prefix)
}

/// Reverse the address scheme
///
/// `<prefix>/<name>` is accepted as a General property as well.
pub fn parse_address(prefix: &str, addr: &str) -> Option<Target> {
    let rest = addr.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();

    match parts.as_slice() {
        ["midi"] => Some(Target::Midi),
        ["initialize"] => Some(Target::Initialize),
        ["general", name] | [name] if !name.is_empty() => {
            Some(Target::Property(GroupAddress::General, name.to_string()))
        }
        ["layers", index, prop] => {
            let layer: usize = index.parse().ok().filter(|l| *l < LAYERS)?;
            match prop.strip_prefix("pedal").and_then(|p| p.split_once('.')) {
                Some((pedal, name)) => {
                    let pedal: usize = pedal.parse().ok().filter(|p| *p < PEDALS)?;
                    Some(Target::Property(GroupAddress::Pedal(layer, pedal), name.to_string()))
                }
                None => Some(Target::Property(GroupAddress::Layer(layer), prop.to_string())),
            }
        }
        _ => None,
    }
}

pub fn to_osc(value: &Value) -> OscType {
    match value {
        Value::Bool(b) => OscType::Bool(*b),
        Value::Int(n) => OscType::Int((*n).clamp(i32::MIN as i64, i32::MAX as i64) as i32),
        Value::Text(s) => OscType::String(s.clone()),
    }
}

pub fn from_osc(arg: &OscType) -> Option<Value> {
    match arg {
        OscType::Bool(b) => Some(Value::Bool(*b)),
        OscType::Int(n) => Some(Value::Int(*n as i64)),
        OscType::Long(n) => Some(Value::Int(*n)),
        OscType::Float(f) => Some(Value::Int(f.round() as i64)),
        OscType::Double(d) => Some(Value::Int(d.round() as i64)),
        OscType::String(s) => Some(Value::Text(s.clone())),
        _ => None,
    }
}

fn message(addr: String, args: Vec<OscType>) -> OscPacket {
    OscPacket::Message(OscMessage { addr, args })
}

/// One bundle holding a message per change, in issue order
pub fn encode_changes(prefix: &str, changes: &[PropertyChange]) -> Result<Vec<u8>> {
    let content = changes
        .iter()
        .map(|c| message(address(prefix, c.source, &c.name), vec![to_osc(&c.value)]))
        .collect();
    let bundle = OscBundle {
        // "immediately"
        timetag: OscTime::from((0, 1)),
        content,
    };
    Ok(encoder::encode(&OscPacket::Bundle(bundle))?)
}

pub fn encode_message(addr: String, args: Vec<OscType>) -> Result<Vec<u8>> {
    Ok(encoder::encode(&message(addr, args))?)
}

/// Prepend the 4-byte length
pub fn frame(body: &[u8], order: ByteOrder) -> Vec<u8> {
    let len = body.len() as u32;
    let prefix = match order {
        ByteOrder::Big => len.to_be_bytes(),
        ByteOrder::Little => len.to_le_bytes(),
    };
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(body);
    out
}

pub fn frame_len(prefix: [u8; 4], order: ByteOrder) -> usize {
    match order {
        ByteOrder::Big => u32::from_be_bytes(prefix) as usize,
        ByteOrder::Little => u32::from_le_bytes(prefix) as usize,
    }
}

/// Decode a frame body into its messages, flattening nested bundles
pub fn decode_messages(body: &[u8]) -> Result<Vec<OscMessage>> {
    let (_, packet) = decoder::decode_udp(body)?;
    let mut out = Vec::new();
    let mut stack = vec![packet];
    while let Some(packet) = stack.pop() {
        match packet {
            OscPacket::Message(m) => out.push(m),
            OscPacket::Bundle(b) => stack.extend(b.content.into_iter().rev()),
        }
    }
    if out.is_empty() {
        return Err(SyncError::Osc("empty bundle".into()));
    }
    Ok(out)
}
