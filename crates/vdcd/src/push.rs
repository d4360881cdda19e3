//! Outbound notification pipeline.
//!
//! Every push ultimately goes through the active session's writer. When no
//! session is connected the notification is dropped on the floor: the
//! controller re-queries state on reconnect, so queueing would only grow
//! stale. [`PushSender`] is the host-wide slot the session plugs into;
//! [`DevicePush`] is the per-device handle components push through.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};
use vdcproto::{DsUid, Envelope, Message, PropertyMap, PropertyValue};

/// Host-wide outbound slot. Cloned into every entity; the session connects
/// and disconnects the actual channel as it comes and goes.
#[derive(Clone, Default)]
pub struct PushSender {
    slot: Arc<Mutex<Option<UnboundedSender<Envelope>>>>,
}

impl PushSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the active session's outbound channel.
    pub fn connect(&self, tx: UnboundedSender<Envelope>) {
        *self.slot.lock().unwrap() = Some(tx);
    }

    /// Detach on disconnect; subsequent pushes are dropped.
    pub fn disconnect(&self) {
        *self.slot.lock().unwrap() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Send a notification, or drop it silently when no session is active.
    /// Returns whether the envelope was handed to a session.
    pub fn send(&self, envelope: Envelope) -> bool {
        let mut slot = self.slot.lock().unwrap();
        match slot.as_ref() {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    // Writer task is gone; treat as disconnected.
                    *slot = None;
                    false
                } else {
                    true
                }
            }
            None => {
                trace!("no active session, dropping push");
                false
            }
        }
    }
}

/// Per-device push handle: knows the device identity so components can emit
/// well-formed push-property notifications without a device back-pointer.
#[derive(Clone)]
pub struct DevicePush {
    dsuid: DsUid,
    sender: PushSender,
}

impl DevicePush {
    pub fn new(dsuid: DsUid, sender: PushSender) -> Self {
        Self { dsuid, sender }
    }

    pub fn dsuid(&self) -> DsUid {
        self.dsuid
    }

    /// Push an arbitrary property subtree for this device.
    pub fn push_properties(&self, properties: Option<PropertyValue>) -> bool {
        let sent = self.sender.send(Envelope::notification(Message::PushProperty {
            dsuid: self.dsuid,
            properties,
        }));
        debug!(dsuid = %self.dsuid, sent, "push property");
        sent
    }

    /// Push a single channel state change.
    pub fn push_channel_state(&self, channel_type: u8, value: f64) -> bool {
        let mut channel = PropertyMap::new();
        channel.insert("value".into(), value.into());
        let mut states = PropertyMap::new();
        states.insert(channel_type.to_string(), channel.into());
        let mut root = PropertyMap::new();
        root.insert("channelStates".into(), states.into());
        self.push_properties(Some(root.into()))
    }

    /// Push a button state in click mode.
    pub fn push_button_click(&self, index: u8, value: Option<bool>, click_type: u8) -> bool {
        let mut state = PropertyMap::new();
        if let Some(v) = value {
            state.insert("value".into(), v.into());
        }
        state.insert("clickType".into(), (click_type as i64).into());
        self.push_input_state("buttonInputStates", index, state)
    }

    /// Push a button state in action mode.
    pub fn push_button_action(&self, index: u8, action_id: u64, action_mode: u8) -> bool {
        let mut state = PropertyMap::new();
        state.insert("actionId".into(), (action_id as i64).into());
        state.insert("actionMode".into(), (action_mode as i64).into());
        self.push_input_state("buttonInputStates", index, state)
    }

    /// Push a binary input transition.
    pub fn push_binary_input(&self, index: u8, state: bool) -> bool {
        let mut map = PropertyMap::new();
        map.insert("value".into(), state.into());
        self.push_input_state("binaryInputStates", index, map)
    }

    /// Push a sensor value.
    pub fn push_sensor_value(&self, index: u8, value: f64) -> bool {
        let mut map = PropertyMap::new();
        map.insert("value".into(), value.into());
        self.push_input_state("sensorStates", index, map)
    }

    /// Push a sensor error state.
    pub fn push_sensor_error(&self, index: u8, error: &str) -> bool {
        let mut map = PropertyMap::new();
        map.insert("error".into(), error.into());
        self.push_input_state("sensorStates", index, map)
    }

    fn push_input_state(&self, section: &str, index: u8, state: PropertyMap) -> bool {
        let mut states = PropertyMap::new();
        states.insert(index.to_string(), state.into());
        let mut root = PropertyMap::new();
        root.insert(section.into(), states.into());
        self.push_properties(Some(root.into()))
    }
}
