//! Static property tables and validators
//!
//! Each group kind declares an ordered table of `(name, default, validator)`.
//! Validators are total: out-of-range input is clamped or coerced, never
//! rejected.

use once_cell::sync::Lazy;

use super::program;
use super::value::Value;

/// The three kinds of property groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Device-wide settings
    General,
    /// One of the parallel sound layers
    Layer,
    /// One pedal of a layer
    Pedal,
}

/// Percussion codes understood by the device, in index order
pub const PERCUSSIONS: [(&str, i64); 5] = [
    ("Off", 0x00),
    ("4, Short", 0x01),
    ("2+2/3, Short", 0x02),
    ("4, Long", 0x41),
    ("2+2/3, Long", 0x42),
];

/// Read access to sibling values, used by range validators
pub trait SiblingValues {
    fn sibling(&self, name: &str) -> Option<&Value>;
}

/// Validation rule for a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator {
    /// Integer clamped into `[min, max]`
    Clamp { min: i64, max: i64 },
    /// Boolean coercion
    Bool,
    /// Clamp into `[0, <upper sibling>]`
    RangeLower { upper: &'static str },
    /// Clamp into `[<lower sibling>, max]`
    RangeUpper { lower: &'static str, max: i64 },
    /// Program table key or raw program id; anything else keeps the current value
    Program,
    /// Percussion code, or an index into the percussion table
    Percussion,
}

impl Validator {
    /// Validate a candidate against the group's current state
    pub fn validate(&self, siblings: &dyn SiblingValues, current: &Value, candidate: &Value) -> Value {
        match *self {
            Validator::Clamp { min, max } => Value::Int(candidate.as_int().clamp(min, max)),
            Validator::Bool => Value::Bool(candidate.as_bool()),
            Validator::RangeLower { upper } => {
                let upper = siblings.sibling(upper).map(Value::as_int).unwrap_or(127);
                Value::Int(candidate.as_int().clamp(0, upper.max(0)))
            }
            Validator::RangeUpper { lower, max } => {
                let lower = siblings.sibling(lower).map(Value::as_int).unwrap_or(0);
                Value::Int(candidate.as_int().clamp(lower.min(max), max))
            }
            // Stored in canonical form: table key when known, raw id otherwise
            Validator::Program => match candidate.as_text().and_then(program::resolve) {
                Some((pc, msb, lsb)) => Value::Text(program::from_bytes(pc, msb, lsb)),
                None => current.clone(),
            },
            Validator::Percussion => {
                let v = candidate.as_int();
                if PERCUSSIONS.iter().any(|(_, code)| *code == v) {
                    Value::Int(v)
                } else {
                    let idx = v.clamp(0, PERCUSSIONS.len() as i64 - 1) as usize;
                    Value::Int(PERCUSSIONS[idx].1)
                }
            }
        }
    }
}

/// Declaration of one property
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub default: Value,
    pub validator: Validator,
}

impl PropertyDescriptor {
    fn new(name: impl Into<String>, default: Value, validator: Validator) -> Self {
        Self {
            name: name.into(),
            default,
            validator,
        }
    }

    fn clamp(name: impl Into<String>, default: i64, min: i64, max: i64) -> Self {
        Self::new(name, Value::Int(default), Validator::Clamp { min, max })
    }

    fn flag(name: impl Into<String>, default: bool) -> Self {
        Self::new(name, Value::Bool(default), Validator::Bool)
    }
}

/// Number of layers on the device
pub const LAYERS: usize = 8;
/// Pedals per layer (and pedal slots in the general block)
pub const PEDALS: usize = 8;
/// Harmonic (drawbar) count per layer
pub const HARMONIC_BARS: usize = 9;

static GENERAL: Lazy<Vec<PropertyDescriptor>> = Lazy::new(|| {
    let mut t = vec![PropertyDescriptor::flag("enable", false)];
    for prefix in ["pedal_cc", "pedal_mode", "pedal_min", "pedal_max"] {
        let default = if prefix == "pedal_max" { 127 } else { 0 };
        for i in 0..PEDALS {
            t.push(PropertyDescriptor::clamp(format!("{}{}", prefix, i), default, 0, 127));
        }
    }
    t
});

static LAYER: Lazy<Vec<PropertyDescriptor>> = Lazy::new(|| {
    let mut t = vec![
        PropertyDescriptor::flag("enabled", false),
        PropertyDescriptor::flag("active", true),
        PropertyDescriptor::new("rangel", Value::Int(21), Validator::RangeLower { upper: "rangeu" }),
        PropertyDescriptor::new(
            "rangeu",
            Value::Int(108),
            Validator::RangeUpper { lower: "rangel", max: 127 },
        ),
        PropertyDescriptor::new("program", Value::Text("piano".into()), Validator::Program),
        PropertyDescriptor::clamp("volume", 100, 0, 127),
        PropertyDescriptor::clamp("transposition", 0, -64, 63),
        PropertyDescriptor::clamp("transposition_extra", 0, -64, 63),
        PropertyDescriptor::clamp("release", 0, -64, 63),
        PropertyDescriptor::clamp("attack", 0, -64, 63),
        PropertyDescriptor::clamp("cutoff", 0, -64, 63),
        PropertyDescriptor::clamp("decay", 0, -64, 63),
        PropertyDescriptor::new("percussion", Value::Int(0), Validator::Percussion),
    ];
    for i in 0..HARMONIC_BARS {
        t.push(PropertyDescriptor::clamp(format!("harmonic_bar{}", i), 0, 0, 15));
    }
    t.push(PropertyDescriptor::clamp("portamento_time", 0, 0, 127));
    t.push(PropertyDescriptor::clamp("volume_ch", 0, 0, 127));
    t
});

static PEDAL: Lazy<Vec<PropertyDescriptor>> = Lazy::new(|| {
    vec![
        PropertyDescriptor::clamp("cc", 0, 0, 127),
        PropertyDescriptor::clamp("mode", 0, 0, 127),
    ]
});

/// Descriptor table for a group kind
pub fn table(kind: GroupKind) -> &'static [PropertyDescriptor] {
    match kind {
        GroupKind::General => &GENERAL,
        GroupKind::Layer => &LAYER,
        GroupKind::Pedal => &PEDAL,
    }
}
