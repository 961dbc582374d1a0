//! Preset values as a flat map, applied inside one bundle

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::property::Value;

/// Named preset from the configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Preset {
    pub name: String,
    /// Short label for compact displays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub values: PresetMap,
}

/// `{general: {name: value}, layers: {index: {name: value, pedals: {index: {...}}}}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PresetMap {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub general: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub layers: BTreeMap<usize, LayerPreset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LayerPreset {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pedals: BTreeMap<usize, BTreeMap<String, Value>>,
    #[serde(flatten)]
    pub props: BTreeMap<String, Value>,
}
