//! Recursive property trees exchanged over the vDC API.
//!
//! Leaves are typed scalars; internal nodes are named maps or indexed
//! sequences. Entities expose their state as these trees and accept writes
//! through them; validation of a leaf against an entity's concrete field
//! happens at the entity border, not here.
//!
//! On the JSON wire, binary leaves travel as base64 text and decode back as
//! [`PropertyValue::Text`]; [`PropertyValue::as_bytes`] recovers the raw
//! bytes either way.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named map node.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A node in a property tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    Seq(Vec<PropertyValue>),
    Map(PropertyMap),
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

impl PropertyValue {
    /// An empty map node, the usual root for entity property trees.
    pub fn empty_map() -> Self {
        PropertyValue::Map(PropertyMap::new())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric accessor; integers widen to doubles since the wire does not
    /// distinguish `50` from `50.0` for channel values.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            PropertyValue::Double(d) => Some(*d),
            PropertyValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes from a binary leaf, or base64-decoded text.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            PropertyValue::Binary(b) => Some(b.clone()),
            PropertyValue::Text(s) => base64::engine::general_purpose::STANDARD.decode(s).ok(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PropertyMap> {
        match self {
            PropertyValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::Seq(s) => Some(s),
            _ => None,
        }
    }

    /// A human label for the node's type, used in rejection diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Double(_) => "double",
            PropertyValue::Text(_) => "string",
            PropertyValue::Binary(_) => "bytes",
            PropertyValue::Seq(_) => "sequence",
            PropertyValue::Map(_) => "map",
        }
    }

    /// Whether this node, used as a get-property query, means "everything".
    pub fn is_wildcard_query(&self) -> bool {
        match self {
            PropertyValue::Map(m) => m.is_empty(),
            PropertyValue::Seq(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Walk a dotted path through nested maps.
    pub fn get_path(&self, path: &str) -> Option<&PropertyValue> {
        let mut node = self;
        for segment in path.split('.') {
            node = node.as_map()?.get(segment)?;
        }
        Some(node)
    }

    /// Set a dotted path, creating intermediate maps as needed. Returns false
    /// if an existing intermediate node is not a map.
    pub fn set_path(&mut self, path: &str, value: PropertyValue) -> bool {
        let mut node = self;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let map = match node {
                PropertyValue::Map(m) => m,
                _ => return false,
            };
            if i == segments.len() - 1 {
                map.insert((*segment).to_string(), value);
                return true;
            }
            node = map
                .entry((*segment).to_string())
                .or_insert_with(PropertyValue::empty_map);
        }
        false
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<PropertyMap> for PropertyValue {
    fn from(v: PropertyMap) -> Self {
        PropertyValue::Map(v)
    }
}

/// Filter a full property tree down to the shape requested by a query.
///
/// An empty or wildcard query returns the whole tree. A map query selects the
/// named keys; where the query value is itself a map, filtering recurses.
/// Keys requested but absent are simply omitted.
pub fn filter_by_query(full: &PropertyValue, query: &PropertyValue) -> PropertyValue {
    if query.is_wildcard_query() {
        return full.clone();
    }
    match (full, query) {
        (PropertyValue::Map(tree), PropertyValue::Map(wanted)) => {
            let mut out = PropertyMap::new();
            for (key, sub_query) in wanted {
                if let Some(node) = tree.get(key) {
                    out.insert(key.clone(), filter_by_query(node, sub_query));
                }
            }
            PropertyValue::Map(out)
        }
        _ => full.clone(),
    }
}
