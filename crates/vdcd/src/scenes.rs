//! Scene table types: per-scene configuration, transition effects, undo
//! snapshots and the local-priority lock.
//!
//! Scene numbers run 0..=127. Every scene stores a target value per output
//! channel plus an effect and two flags. `dontCare` makes a call a no-op
//! unless forced; `ignoreLocalPriority` lets a scene bypass the device's
//! local-priority lock.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, VecDeque};

/// Highest valid scene number.
pub const MAX_SCENE: u8 = 127;

/// Undo history bound. Source-chosen heuristic, not a wire requirement.
pub const UNDO_DEPTH: usize = 5;

/// Well-known scene numbers used by the controller UI.
pub mod well_known {
    pub const OFF: u8 = 0;
    pub const DEEP_OFF: u8 = 5;
    pub const STANDBY: u8 = 6;
    pub const WAKE_UP: u8 = 7;
    pub const MIN: u8 = 14;
    pub const MAX: u8 = 15;
}

/// Transition style applied when a scene is recalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneEffect {
    None,
    #[default]
    Smooth,
    Slow,
    VerySlow,
    Alert,
}

/// How scene values are applied to the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneMode {
    /// Apply every stored channel value.
    Normal,
    /// Apply a channel only when it would raise the current value.
    Min,
}

/// Stored configuration for one scene number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Target value per channel type.
    #[serde(default)]
    pub channels: BTreeMap<u8, f64>,
    #[serde(default)]
    pub effect: SceneEffect,
    #[serde(default)]
    pub dont_care: bool,
    #[serde(default)]
    pub ignore_local_priority: bool,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
            effect: SceneEffect::Smooth,
            dont_care: false,
            ignore_local_priority: false,
        }
    }
}

/// Channel-type → value snapshot used for undo entries and scene capture.
pub type ChannelValues = BTreeMap<u8, f64>;

/// Bounded LIFO of pre-scene output snapshots.
#[derive(Debug, Default)]
pub struct UndoStack {
    entries: VecDeque<ChannelValues>,
}

impl UndoStack {
    /// Push a snapshot, dropping the oldest entry past [`UNDO_DEPTH`].
    pub fn push(&mut self, snapshot: ChannelValues) {
        self.entries.push_back(snapshot);
        while self.entries.len() > UNDO_DEPTH {
            self.entries.pop_front();
        }
    }

    pub fn pop(&mut self) -> Option<ChannelValues> {
        self.entries.pop_back()
    }

    /// Discard the most recent snapshot. Used when a scene call turns out to
    /// be blocked after its snapshot was already taken.
    pub fn discard_last(&mut self) {
        self.entries.pop_back();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Device-level lock: non-matching scene calls are ignored unless forced or
/// flagged with `ignoreLocalPriority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPriority {
    /// Lock to one specific scene number.
    Scene(u8),
    /// Global lock, rendered as `*`.
    Global,
}

impl LocalPriority {
    /// Whether a call for `scene` matches the lock.
    pub fn matches(&self, scene: u8) -> bool {
        match self {
            LocalPriority::Scene(locked) => *locked == scene,
            LocalPriority::Global => false,
        }
    }
}

impl Serialize for LocalPriority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LocalPriority::Scene(n) => serializer.serialize_u8(*n),
            LocalPriority::Global => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for LocalPriority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u8),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(LocalPriority::Scene(n)),
            Raw::Text(s) if s == "*" => Ok(LocalPriority::Global),
            Raw::Text(s) => Err(serde::de::Error::custom(format!(
                "invalid local priority '{s}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_stack_is_bounded_lifo() {
        let mut stack = UndoStack::default();
        for i in 0..7u8 {
            let mut snapshot = ChannelValues::new();
            snapshot.insert(1, i as f64);
            stack.push(snapshot);
        }
        assert_eq!(stack.len(), UNDO_DEPTH);

        // Most recent first.
        assert_eq!(stack.pop().unwrap()[&1], 6.0);
        assert_eq!(stack.pop().unwrap()[&1], 5.0);
        // Oldest two (0 and 1) were dropped.
        assert_eq!(stack.len(), 3);
    }

    #[test]
    fn local_priority_matching() {
        assert!(LocalPriority::Scene(5).matches(5));
        assert!(!LocalPriority::Scene(5).matches(6));
        assert!(!LocalPriority::Global.matches(5));
    }

    #[test]
    fn local_priority_serde_forms() {
        let scene = serde_json::to_string(&LocalPriority::Scene(12)).unwrap();
        assert_eq!(scene, "12");
        let global = serde_json::to_string(&LocalPriority::Global).unwrap();
        assert_eq!(global, "\"*\"");

        assert_eq!(
            serde_json::from_str::<LocalPriority>("12").unwrap(),
            LocalPriority::Scene(12)
        );
        assert_eq!(
            serde_json::from_str::<LocalPriority>("\"*\"").unwrap(),
            LocalPriority::Global
        );
        assert!(serde_json::from_str::<LocalPriority>("\"x\"").is_err());
    }

    #[test]
    fn scene_config_defaults() {
        let config: SceneConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.effect, SceneEffect::Smooth);
        assert!(!config.dont_care);
        assert!(!config.ignore_local_priority);
        assert!(config.channels.is_empty());
    }
}
