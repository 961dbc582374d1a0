//! Sound programs known to the layer `program` property
//!
//! A program is addressed on the wire by (program change, bank MSB, bank LSB).
//! Names from the table resolve to those bytes; anything the table does not
//! know travels as a raw id `_pgm_<pc>_<msb>_<lsb>_`.

use once_cell::sync::Lazy;

/// Immutable description of one sound program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    /// Program change number, 1-based (1..=128)
    pub pc: u8,
    pub msb: u8,
    pub lsb: u8,
    /// Effect SysEx payloads that belong with the program
    pub effects: Vec<Vec<u8>>,
    /// Two-letter tag for narrow displays
    pub short: &'static str,
    pub name: &'static str,
}

const EFX_NONE: [u8; 9] = [0x40, 0x40, 0x23, 0x00, 0x00, 0x00, 0x00, 0x08, 0x04];
const EFX_DUMPER: [u8; 9] = [0x40, 0x40, 0x23, 0x00, 0x40, 0x32, 0x40, 0x32, 0x00];
const EFX_ROTARY: [u8; 9] = [0x40, 0x40, 0x23, 0x01, 0x22, 0x00, 0x40, 0x00, 0x7F];
const EFX_EPIANO: [u8; 9] = [0x40, 0x40, 0x23, 0x01, 0x42, 0x00, 0x40, 0x37, 0x02];

/// Program table keyed by property value
pub static PROGRAMS: Lazy<Vec<(&'static str, Program)>> = Lazy::new(|| {
    let p = |pc, msb, lsb, efx: &[u8; 9], short, name| Program {
        pc,
        msb,
        lsb,
        effects: vec![efx.to_vec()],
        short,
        name,
    };
    vec![
        ("piano", p(1, 0, 68, &EFX_DUMPER, "Pn", "Piano")),
        ("epiano", p(5, 0, 67, &EFX_EPIANO, "eP", "E-Piano")),
        ("bass", p(33, 0, 71, &EFX_NONE, "Bs", "Bass")),
        ("hammond", p(17, 32, 68, &EFX_ROTARY, "Hm", "Hammond")),
        ("vibraphone", p(12, 0, 0, &EFX_ROTARY, "Vp", "Vibraphone")),
        ("marimba", p(13, 0, 64, &EFX_ROTARY, "Mb", "Marimba")),
        ("fretlessbass", p(36, 0, 0, &EFX_NONE, "FB", "Fretless Bass")),
    ]
});

fn by_key(key: &str) -> Option<&'static Program> {
    PROGRAMS.iter().find(|(k, _)| *k == key).map(|(_, p)| p)
}

/// Format a raw program id
pub fn raw_id(pc: u8, msb: u8, lsb: u8) -> String {
    format!("_pgm_{}_{}_{}_", pc, msb, lsb)
}

/// Parse a raw program id into (pc, msb, lsb)
pub fn parse_raw_id(id: &str) -> Option<(u8, u8, u8)> {
    let inner = id.strip_prefix("_pgm_")?.strip_suffix('_')?;
    let mut parts = inner.split('_').map(|p| p.parse::<u8>().ok());
    let (pc, msb, lsb) = (parts.next()??, parts.next()??, parts.next()??);
    if parts.next().is_some() || !(1..=128).contains(&pc) || msb > 127 || lsb > 127 {
        return None;
    }
    Some((pc, msb, lsb))
}

/// Resolve a `program` property value into wire bytes (pc, msb, lsb)
pub fn resolve(value: &str) -> Option<(u8, u8, u8)> {
    by_key(value)
        .map(|p| (p.pc, p.msb, p.lsb))
        .or_else(|| parse_raw_id(value))
}

/// Human-readable label of a `program` value, e.g. `Hammond [Hm]`
///
/// Raw ids have no label.
pub fn label(value: &str) -> Option<String> {
    by_key(value).map(|p| format!("{} [{}]", p.name, p.short))
}

/// Inverse of `resolve`: table key when known, raw id otherwise
pub fn from_bytes(pc: u8, msb: u8, lsb: u8) -> String {
    PROGRAMS
        .iter()
        .find(|(_, p)| p.pc == pc && p.msb == msb && p.lsb == lsb)
        .map(|(k, _)| k.to_string())
        .unwrap_or_else(|| raw_id(pc, msb, lsb))
}
