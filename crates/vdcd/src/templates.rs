//! Identity-free device definitions.
//!
//! A [`DeviceDefinition`] is a device's full configuration without its
//! identity: what the template layer instantiates from, what cloning copies,
//! and what persistence stores per device. Instantiating under a new dSUID
//! (or a new enumeration byte, for clones) re-applies the same configuration
//! to a fresh device.

use crate::components::{ButtonMode, OutputFunction, OutputMode};
use crate::scenes::SceneConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vdcproto::{PropertyMap, PropertyValue};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub channel_type: u8,
    #[serde(default)]
    pub ds_index: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDefinition {
    #[serde(default)]
    pub function: OutputFunction,
    #[serde(default)]
    pub mode: OutputMode,
    #[serde(default = "default_push_changes")]
    pub push_changes: bool,
    #[serde(default)]
    pub group: u8,
    #[serde(default)]
    pub groups: Vec<u8>,
    #[serde(default)]
    pub channels: Vec<ChannelDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heating_system_capability: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heating_system_type: Option<u8>,
}

fn default_push_changes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonDefinition {
    pub name: String,
    #[serde(default)]
    pub mode: ButtonMode,
    #[serde(default = "default_button_type")]
    pub button_type: u8,
    #[serde(default)]
    pub element: u8,
}

fn default_button_type() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryInputDefinition {
    pub name: String,
    pub input_type: u8,
    #[serde(default)]
    pub usage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_function: Option<u8>,
    #[serde(default)]
    pub invert: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDefinition {
    pub name: String,
    pub sensor_type: u8,
    #[serde(default)]
    pub usage: u8,
    pub unit: String,
    pub min: f64,
    pub max: f64,
    pub resolution: f64,
    #[serde(default)]
    pub hysteresis: f64,
    /// Seconds; floor between any two pushes.
    #[serde(default = "default_min_push_interval")]
    pub min_push_interval: f64,
    /// Seconds; floor between same-value pushes. Zero disables the gate.
    #[serde(default)]
    pub changes_only_interval: f64,
}

fn default_min_push_interval() -> f64 {
    2.0
}

/// A complete device configuration without identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub primary_group: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_features: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<ButtonDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binary_inputs: Vec<BinaryInputDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensors: Vec<SensorDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scenes: BTreeMap<u8, SceneConfig>,
}

/// Serialize a definition into the property-map form used by the store and
/// by announce/property subtrees.
pub fn definition_to_properties(def: &DeviceDefinition) -> Result<PropertyMap, serde_json::Error> {
    let value = serde_json::to_value(def)?;
    let tree: PropertyValue = serde_json::from_value(value)?;
    Ok(tree.as_map().cloned().unwrap_or_default())
}

/// Parse a definition back out of a property map, ignoring foreign keys
/// (like the store's `connector` back-reference).
pub fn definition_from_properties(map: &PropertyMap) -> Result<DeviceDefinition, serde_json::Error> {
    let value = serde_json::to_value(PropertyValue::Map(map.clone()))?;
    serde_json::from_value(value)
}
