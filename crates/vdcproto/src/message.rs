//! Typed protocol envelopes for the vDC API session.
//!
//! Every wire message is an [`Envelope`]: a discriminated union selected by
//! the `type` field, with an optional `messageId` that is present on requests
//! and echoed on their responses. Notifications never carry a `messageId` on
//! the wire; a zero id is treated as unset and cleared before serializing.
//!
//! Decode failures are recoverable by contract: the session logs the hex dump
//! and keeps reading. Only framing violations tear a session down.

use crate::dsuid::DsUid;
use crate::property::PropertyValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result code for generic responses: success.
pub const CODE_OK: u32 = 200;
/// Result code for generic responses: addressed entity unknown.
pub const CODE_NOT_FOUND: u32 = 404;
/// Result code for generic responses: handler or dispatch failure.
pub const CODE_ERROR: u32 = 500;

/// Direction of a dim-channel notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimMode {
    Stop,
    Down,
    Up,
}

/// The complete message catalog, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    // === Session handshake and keepalive ===
    /// First message the controller must send (request).
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_version: Option<String>,
    },
    /// Handshake reply carrying the host identity.
    HelloResponse { dsuid: DsUid, api_version: String },
    /// Liveness probe, either direction.
    Ping,
    /// Liveness reply, either direction.
    Pong,
    /// Graceful session termination.
    Bye,

    // === Property access (requests) ===
    GetProperty {
        dsuid: DsUid,
        #[serde(default = "PropertyValue::empty_map")]
        query: PropertyValue,
    },
    GetPropertyResponse { properties: PropertyValue },
    SetProperty {
        dsuid: DsUid,
        properties: PropertyValue,
    },

    // === Generic request/response ===
    GenericRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dsuid: Option<DsUid>,
        method: String,
        #[serde(default = "PropertyValue::empty_map")]
        params: PropertyValue,
    },
    GenericResponse {
        code: u32,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<PropertyValue>,
    },

    // === Device removal ===
    Remove { dsuid: DsUid },
    RemoveResult { code: u32 },

    // === Scene and output notifications (controller → host) ===
    CallScene {
        dsuid: DsUid,
        scene: u8,
        #[serde(default)]
        force: bool,
    },
    SaveScene { dsuid: DsUid, scene: u8 },
    UndoScene { dsuid: DsUid },
    CallMinScene { dsuid: DsUid, scene: u8 },
    SetLocalPriority {
        dsuid: DsUid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scene: Option<u8>,
    },
    SetOutputChannelValue {
        dsuid: DsUid,
        channel: u8,
        value: f64,
        #[serde(default = "default_true")]
        apply_now: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transition_time: Option<f64>,
    },
    DimChannel {
        dsuid: DsUid,
        channel: u8,
        mode: DimMode,
    },
    SetControlValue {
        dsuid: DsUid,
        name: String,
        value: f64,
    },
    Identify {
        dsuid: DsUid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },

    // === Host → controller notifications ===
    PushProperty {
        dsuid: DsUid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        properties: Option<PropertyValue>,
    },
    AnnounceConnector {
        dsuid: DsUid,
        properties: PropertyValue,
    },
    AnnounceDevice {
        dsuid: DsUid,
        properties: PropertyValue,
    },
    Vanish { dsuid: DsUid },
}

fn default_true() -> bool {
    true
}

impl Message {
    /// Whether this tag is a request (expects a correlated response).
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Hello { .. }
                | Message::GetProperty { .. }
                | Message::SetProperty { .. }
                | Message::GenericRequest { .. }
                | Message::Remove { .. }
        )
    }

    /// Short tag name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloResponse { .. } => "helloResponse",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Bye => "bye",
            Message::GetProperty { .. } => "getProperty",
            Message::GetPropertyResponse { .. } => "getPropertyResponse",
            Message::SetProperty { .. } => "setProperty",
            Message::GenericRequest { .. } => "genericRequest",
            Message::GenericResponse { .. } => "genericResponse",
            Message::Remove { .. } => "remove",
            Message::RemoveResult { .. } => "removeResult",
            Message::CallScene { .. } => "callScene",
            Message::SaveScene { .. } => "saveScene",
            Message::UndoScene { .. } => "undoScene",
            Message::CallMinScene { .. } => "callMinScene",
            Message::SetLocalPriority { .. } => "setLocalPriority",
            Message::SetOutputChannelValue { .. } => "setOutputChannelValue",
            Message::DimChannel { .. } => "dimChannel",
            Message::SetControlValue { .. } => "setControlValue",
            Message::Identify { .. } => "identify",
            Message::PushProperty { .. } => "pushProperty",
            Message::AnnounceConnector { .. } => "announceConnector",
            Message::AnnounceDevice { .. } => "announceDevice",
            Message::Vanish { .. } => "vanish",
        }
    }
}

/// Outer wire envelope: optional correlation id plus the typed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(
        rename = "messageId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<u32>,

    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// A notification envelope (no correlation id).
    pub fn notification(message: Message) -> Self {
        Self {
            message_id: None,
            message,
        }
    }

    /// A request envelope with a correlation id.
    pub fn request(message_id: u32, message: Message) -> Self {
        Self {
            message_id: Some(message_id),
            message,
        }
    }

    /// A generic response, the catch-all reply shape.
    pub fn generic_response(code: u32, description: impl Into<String>) -> Self {
        Self::notification(Message::GenericResponse {
            code,
            description: description.into(),
            result: None,
        })
    }
}

/// Codec failures. Malformed inbound payloads are recoverable; the hex dump
/// of the offending bytes is carried in the error for the log line.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope ({source}); payload hex: {payload_hex}")]
    Malformed {
        source: serde_json::Error,
        payload_hex: String,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Decode a framed payload into an envelope.
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(payload).map_err(|source| CodecError::Malformed {
        source,
        payload_hex: hex::encode(payload),
    })
}

/// Tags the catalog knows. Used to tell "unsupported message type" apart
/// from a malformed payload of a known type.
pub const KNOWN_TYPES: &[&str] = &[
    "hello",
    "helloResponse",
    "ping",
    "pong",
    "bye",
    "getProperty",
    "getPropertyResponse",
    "setProperty",
    "genericRequest",
    "genericResponse",
    "remove",
    "removeResult",
    "callScene",
    "saveScene",
    "undoScene",
    "callMinScene",
    "setLocalPriority",
    "setOutputChannelValue",
    "dimChannel",
    "setControlValue",
    "identify",
    "pushProperty",
    "announceConnector",
    "announceDevice",
    "vanish",
];

/// Best-effort probe of a payload that failed full decoding: recovers the
/// type tag and messageId so an unsupported request can still be answered
/// with a generic error.
pub fn probe_unknown(payload: &[u8]) -> Option<(String, Option<u32>)> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "type")]
        kind: String,
        #[serde(rename = "messageId", default)]
        message_id: Option<u32>,
    }
    serde_json::from_slice::<Probe>(payload)
        .ok()
        .map(|p| (p.kind, p.message_id))
}

/// Encode an envelope for framing. A `messageId` of zero is the unset
/// sentinel and is cleared so notifications never carry one on the wire.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut out = envelope.clone();
    if out.message_id == Some(0) {
        out.message_id = None;
    }
    Ok(serde_json::to_vec(&out)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyMap;

    #[test]
    fn request_classification() {
        let uid = DsUid::device("acme", "d1", 0);
        assert!(Message::Hello { api_version: None }.is_request());
        assert!(Message::Remove { dsuid: uid }.is_request());
        assert!(!Message::Ping.is_request());
        assert!(!Message::CallScene {
            dsuid: uid,
            scene: 5,
            force: false
        }
        .is_request());
        assert!(!Message::Vanish { dsuid: uid }.is_request());
    }

    #[test]
    fn envelope_round_trip() {
        let uid = DsUid::device("acme", "d1", 0);
        let env = Envelope::request(
            7,
            Message::GetProperty {
                dsuid: uid,
                query: PropertyValue::empty_map(),
            },
        );
        let bytes = encode_envelope(&env).unwrap();
        let back = decode_envelope(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.message_id, Some(7));
    }

    #[test]
    fn zero_message_id_cleared_on_encode() {
        let env = Envelope {
            message_id: Some(0),
            message: Message::Pong,
        };
        let bytes = encode_envelope(&env).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains("messageId"));
        assert_eq!(decode_envelope(&bytes).unwrap().message_id, None);
    }

    #[test]
    fn notifications_have_no_message_id() {
        let env = Envelope::notification(Message::Ping);
        let text = String::from_utf8(encode_envelope(&env).unwrap()).unwrap();
        assert!(!text.contains("messageId"));
        assert!(text.contains("\"type\":\"ping\""));
    }

    #[test]
    fn malformed_payload_carries_hex_dump() {
        let err = decode_envelope(b"\xFF\xFEnot json").unwrap_err();
        match err {
            CodecError::Malformed { payload_hex, .. } => {
                assert!(payload_hex.starts_with("fffe"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn call_scene_defaults_force_false() {
        let uid = DsUid::device("acme", "d1", 0);
        let json = format!(r#"{{"type":"callScene","dsuid":"{uid}","scene":17}}"#);
        let env = decode_envelope(json.as_bytes()).unwrap();
        match env.message {
            Message::CallScene { scene, force, .. } => {
                assert_eq!(scene, 17);
                assert!(!force);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn set_output_channel_value_defaults() {
        let uid = DsUid::device("acme", "d1", 0);
        let json = format!(
            r#"{{"type":"setOutputChannelValue","dsuid":"{uid}","channel":1,"value":50.0}}"#
        );
        let env = decode_envelope(json.as_bytes()).unwrap();
        match env.message {
            Message::SetOutputChannelValue {
                channel,
                value,
                apply_now,
                transition_time,
                ..
            } => {
                assert_eq!(channel, 1);
                assert_eq!(value, 50.0);
                assert!(apply_now);
                assert!(transition_time.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn push_property_with_subtree() {
        let uid = DsUid::device("acme", "d1", 0);
        let mut props = PropertyMap::new();
        props.insert("sensorStates".into(), PropertyValue::empty_map());
        let env = Envelope::notification(Message::PushProperty {
            dsuid: uid,
            properties: Some(PropertyValue::Map(props)),
        });
        let bytes = encode_envelope(&env).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), env);
    }
}
