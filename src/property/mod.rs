//! Declarative, validated property model
//!
//! Groups are built from static descriptor tables; every write goes through
//! the descriptor's validator and only real changes are reported.

mod descriptor;
mod group;
pub mod program;
mod value;

pub use descriptor::{
    table, GroupKind, PropertyDescriptor, SiblingValues, Validator, HARMONIC_BARS, LAYERS, PEDALS, PERCUSSIONS,
};
pub use group::{GroupAddress, PropertyChange, PropertyGroup};
pub use program::Program;
pub use value::Value;
