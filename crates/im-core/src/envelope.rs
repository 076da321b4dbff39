//! Bus envelope: the unit exchanged with the upstream peer.
//!
//! JSON shape: `{"event", "session_id", "headers"?, "message_type"?, "payload"?}`
//! where `payload` is standard base64 and `message_type` follows WebSocket
//! opcode numbering (1 = text, 2 = binary, 0/absent = text).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata header names carried on `session_open`.
pub mod headers {
    pub const DEVICE_ID: &str = "Device-Id";
    pub const CLIENT_ID: &str = "Client-Id";
    pub const SESSION_ID: &str = "Session-Id";
    pub const TRANSPORT_TYPE: &str = "Transport-Type";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const USER_ID: &str = "User-Id";
    pub const TOKEN: &str = "Token";
}

/// Envelope event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionOpen,
    SessionClose,
    Data,
    /// Any event name this gateway does not understand.
    #[serde(other)]
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionOpen => "session_open",
            EventType::SessionClose => "session_close",
            EventType::Data => "data",
            EventType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client frame kind, numbered like WebSocket opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FrameKind {
    Text = 1,
    Binary = 2,
}

impl FrameKind {
    /// Map an envelope `message_type` to a frame kind. Zero means text.
    pub fn from_message_type(v: i32) -> Option<Self> {
        match v {
            0 | 1 => Some(FrameKind::Text),
            2 => Some(FrameKind::Binary),
            _ => None,
        }
    }

    pub fn message_type(self) -> i32 {
        self as i32
    }
}

/// One protocol event on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: EventType,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub message_type: i32,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn session_open(session_id: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            event: EventType::SessionOpen,
            session_id: session_id.into(),
            headers,
            message_type: 0,
            payload: Vec::new(),
        }
    }

    pub fn session_close(session_id: impl Into<String>) -> Self {
        Self {
            event: EventType::SessionClose,
            session_id: session_id.into(),
            headers: HashMap::new(),
            message_type: 0,
            payload: Vec::new(),
        }
    }

    pub fn data(session_id: impl Into<String>, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            event: EventType::Data,
            session_id: session_id.into(),
            headers: HashMap::new(),
            message_type: kind.message_type(),
            payload,
        }
    }

    /// Framing for a `data` envelope; `None` for an unsupported message type.
    pub fn frame_kind(&self) -> Option<FrameKind> {
        FrameKind::from_message_type(self.message_type)
    }
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(d)?;
        match encoded {
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
