//! Register block layout (v1)
//!
//! Maps property names onto byte offsets of the General and Layer blocks.
//! Pedals have no block of their own; they live inside their layer's block.
//! All bytes are 7-bit; signed properties are stored with a +64 bias.

use crate::property::{program, GroupAddress, PropertyChange, Value, HARMONIC_BARS, LAYERS, PEDALS};
use crate::transport::RemoteValue;

/// Bytes of the General block covered by the layout
pub const GENERAL_LAYOUT_LEN: usize = 38;
/// Bytes of a Layer block covered by the layout
pub const LAYER_LAYOUT_LEN: usize = 44;

/// Write-only init byte, same offset in both blocks
pub const INIT: usize = 2;

mod general {
    pub const CONFIG: usize = 0;
    pub const PEDAL_CC: usize = 6;
    pub const PEDAL_MODE: usize = 14;
    pub const PEDAL_MIN: usize = 22;
    pub const PEDAL_MAX: usize = 30;

    pub const BIT_ENABLE: u8 = 0;
    pub const BIT_ADC_RAWDATA: u8 = 5;
    pub const BIT_KEEP_ALIVE: u8 = 6;

    pub const PEDAL_ARRAYS: [(&str, usize); 4] = [
        ("pedal_cc", PEDAL_CC),
        ("pedal_mode", PEDAL_MODE),
        ("pedal_min", PEDAL_MIN),
        ("pedal_max", PEDAL_MAX),
    ];
}

mod layer {
    pub const CONFIG: usize = 0;
    pub const PROGRAM: usize = 3;
    pub const PEDAL_CC: usize = 16;
    pub const PEDAL_MODE: usize = 24;
    pub const HARMONIC_BARS: usize = 33;

    pub const BIT_ENABLED: u8 = 0;
    pub const BIT_ACTIVE: u8 = 1;

    /// Plain one-byte properties
    pub const BYTES: [(&str, usize); 5] = [
        ("rangel", 6),
        ("rangeu", 7),
        ("volume", 8),
        ("percussion", 32),
        ("portamento_time", 42),
    ];

    /// One-byte properties stored with a +64 bias
    pub const BIASED: [(&str, usize); 6] = [
        ("transposition", 10),
        ("transposition_extra", 11),
        ("release", 12),
        ("attack", 13),
        ("cutoff", 14),
        ("decay", 15),
    ];

    pub const VOLUME_CH: usize = 43;
}

fn set_bit(byte: u8, bit: u8, on: bool) -> u8 {
    if on {
        byte | (1 << bit)
    } else {
        byte & !(1 << bit)
    }
}

fn to_byte(v: i64) -> u8 {
    v.clamp(0, 127) as u8
}

fn biased(v: i64) -> u8 {
    to_byte(v + 64)
}

/// `pedal_cc3` -> ("pedal_cc", 3)
fn split_index(name: &str) -> Option<(&str, usize)> {
    let pos = name.find(|c: char| c.is_ascii_digit())?;
    let index = name[pos..].parse().ok()?;
    Some((&name[..pos], index))
}

/// Block index on the wire for a block-owning address
pub fn block_index(address: GroupAddress, general_index: u8) -> u8 {
    match address.init_owner() {
        GroupAddress::Layer(l) => l as u8,
        _ => general_index,
    }
}

/// Block-owning address for a wire block index
pub fn block_address(index: u8, general_index: u8) -> Option<GroupAddress> {
    if index == general_index {
        Some(GroupAddress::General)
    } else if (index as usize) < LAYERS {
        Some(GroupAddress::Layer(index as usize))
    } else {
        None
    }
}

/// Patch the bytes of one change into its owning block
///
/// Only the bytes (or bits) assigned to the property are touched. Returns
/// false when the property has no register.
pub fn encode_change(block: &mut [u8], change: &PropertyChange) -> bool {
    let v = &change.value;
    match change.source {
        GroupAddress::General => encode_general(block, &change.name, v),
        GroupAddress::Layer(_) => encode_layer(block, &change.name, v),
        GroupAddress::Pedal(_, p) if p < PEDALS => {
            let offset = match change.name.as_str() {
                "cc" => layer::PEDAL_CC,
                "mode" => layer::PEDAL_MODE,
                _ => return false,
            };
            block[offset + p] = to_byte(v.as_int());
            true
        }
        GroupAddress::Pedal(..) => false,
    }
}

fn encode_general(block: &mut [u8], name: &str, v: &Value) -> bool {
    if name == "enable" {
        block[general::CONFIG] = set_bit(block[general::CONFIG], general::BIT_ENABLE, v.as_bool());
        return true;
    }

    let Some((prefix, i)) = split_index(name) else { return false };
    match general::PEDAL_ARRAYS.iter().find(|(p, _)| *p == prefix) {
        Some((_, base)) if i < PEDALS => {
            block[base + i] = to_byte(v.as_int());
            true
        }
        _ => false,
    }
}

fn encode_layer(block: &mut [u8], name: &str, v: &Value) -> bool {
    match name {
        "enabled" => {
            block[layer::CONFIG] = set_bit(block[layer::CONFIG], layer::BIT_ENABLED, v.as_bool());
            return true;
        }
        "active" => {
            block[layer::CONFIG] = set_bit(block[layer::CONFIG], layer::BIT_ACTIVE, v.as_bool());
            return true;
        }
        "program" => {
            let Some((pc, msb, lsb)) = v.as_text().and_then(program::resolve) else {
                return false;
            };
            block[layer::PROGRAM..layer::PROGRAM + 3].copy_from_slice(&[pc - 1, msb, lsb]);
            return true;
        }
        "volume_ch" => {
            block[layer::VOLUME_CH] = to_byte(v.as_int());
            return true;
        }
        _ => {}
    }

    if let Some((_, offset)) = layer::BYTES.iter().find(|(n, _)| *n == name) {
        block[*offset] = to_byte(v.as_int());
        return true;
    }
    if let Some((_, offset)) = layer::BIASED.iter().find(|(n, _)| *n == name) {
        block[*offset] = biased(v.as_int());
        return true;
    }

    match split_index(name) {
        Some(("harmonic_bar", i)) if i < HARMONIC_BARS => {
            block[layer::HARMONIC_BARS + i] = to_byte(v.as_int());
            true
        }
        _ => false,
    }
}

/// Set the device-side General config flags written after each resync
pub fn encode_device_flags(block: &mut [u8], keep_alive: bool) {
    let c = block[general::CONFIG];
    let c = set_bit(c, general::BIT_KEEP_ALIVE, keep_alive);
    block[general::CONFIG] = set_bit(c, general::BIT_ADC_RAWDATA, false);
}

/// Decode every property value carried by a block
///
/// A Layer block also yields the values of its eight pedals.
pub fn decode_block(address: GroupAddress, block: &[u8]) -> Vec<RemoteValue> {
    match address {
        GroupAddress::General => decode_general(block),
        GroupAddress::Layer(l) => decode_layer(l, block),
        GroupAddress::Pedal(..) => Vec::new(),
    }
}

fn decode_general(c: &[u8]) -> Vec<RemoteValue> {
    let g = GroupAddress::General;
    let mut out = vec![RemoteValue::new(g, "enable", c[general::CONFIG] & (1 << general::BIT_ENABLE) != 0)];
    for (prefix, base) in general::PEDAL_ARRAYS {
        for i in 0..PEDALS {
            out.push(RemoteValue::new(g, format!("{}{}", prefix, i), c[base + i]));
        }
    }
    out
}

fn decode_layer(index: usize, c: &[u8]) -> Vec<RemoteValue> {
    let g = GroupAddress::Layer(index);
    let cfg = c[layer::CONFIG];
    let (pc, msb, lsb) = (c[layer::PROGRAM], c[layer::PROGRAM + 1], c[layer::PROGRAM + 2]);

    let mut out = vec![
        RemoteValue::new(g, "enabled", cfg & (1 << layer::BIT_ENABLED) != 0),
        RemoteValue::new(g, "active", cfg & (1 << layer::BIT_ACTIVE) != 0),
        RemoteValue::new(g, "program", program::from_bytes(pc.saturating_add(1), msb, lsb)),
    ];
    for (name, offset) in layer::BYTES {
        out.push(RemoteValue::new(g, name, c[offset]));
    }
    for (name, offset) in layer::BIASED {
        out.push(RemoteValue::new(g, name, c[offset] as i64 - 64));
    }
    for i in 0..HARMONIC_BARS {
        out.push(RemoteValue::new(g, format!("harmonic_bar{}", i), c[layer::HARMONIC_BARS + i]));
    }
    out.push(RemoteValue::new(g, "volume_ch", c[layer::VOLUME_CH]));

    for p in 0..PEDALS {
        let pedal = GroupAddress::Pedal(index, p);
        out.push(RemoteValue::new(pedal, "cc", c[layer::PEDAL_CC + p]));
        out.push(RemoteValue::new(pedal, "mode", c[layer::PEDAL_MODE + p]));
    }
    out
}

/// Byte span `[start, end)` a property occupies inside its owning block
pub fn register_span(group: GroupAddress, name: &str) -> Option<(usize, usize)> {
    let one = |offset: usize| Some((offset, offset + 1));
    match group {
        GroupAddress::General => {
            if name == "enable" {
                return one(general::CONFIG);
            }
            let (prefix, i) = split_index(name)?;
            let (_, base) = general::PEDAL_ARRAYS.iter().find(|(p, _)| *p == prefix)?;
            (i < PEDALS).then(|| (base + i, base + i + 1))
        }
        GroupAddress::Layer(_) => match name {
            "enabled" | "active" => one(layer::CONFIG),
            "program" => Some((layer::PROGRAM, layer::PROGRAM + 3)),
            "volume_ch" => one(layer::VOLUME_CH),
            _ => {
                let mut table = layer::BYTES.iter().chain(layer::BIASED.iter());
                if let Some((_, offset)) = table.find(|(n, _)| *n == name) {
                    return one(*offset);
                }
                match split_index(name) {
                    Some(("harmonic_bar", i)) if i < HARMONIC_BARS => one(layer::HARMONIC_BARS + i),
                    _ => None,
                }
            }
        },
        GroupAddress::Pedal(_, p) if p < PEDALS => match name {
            "cc" => one(layer::PEDAL_CC + p),
            "mode" => one(layer::PEDAL_MODE + p),
            _ => None,
        },
        GroupAddress::Pedal(..) => None,
    }
}

/// Decode only the values whose bytes overlap `[start, end)` of a block
pub fn decode_range(address: GroupAddress, block: &[u8], start: usize, end: usize) -> Vec<RemoteValue> {
    decode_block(address, block)
        .into_iter()
        .filter(|v| matches!(register_span(v.group, &v.name), Some((s, e)) if s < end && start < e))
        .collect()
}

/// Smallest inclusive range `[first, last]` where the blocks differ
pub fn diff_range(before: &[u8], after: &[u8]) -> Option<(usize, usize)> {
    let first = before.iter().zip(after).position(|(a, b)| a != b)?;
    let last = before.iter().zip(after).rposition(|(a, b)| a != b)?;
    Some((first, last))
}
