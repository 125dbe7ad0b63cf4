//! Connection envelope: `{"type": ..., "data": {...}, "timestamp": ...}`.
//!
//! On the wire an envelope is a loosely typed JSON object. In memory it is a
//! [`Message`] sum type with one variant per recognized `type`, each carrying
//! a statically shaped payload. Unrecognized types decode into
//! [`Message::Unknown`] so newer clients keep working against an older relay.
//!
//! # Invariants
//!
//! - Each variant maps to exactly one `type` string (see [`Message::kind`]).
//! - `status` is shared by the client request and the server report; a
//!   `data` object carrying `connected` decodes as the report.
//! - Decoding dispatches on `type` alone. The inbound types (`heartbeat`,
//!   `ping`, `status`) always decode as themselves: a mistyped field is
//!   dropped and a non-object `data` reads as `{}`. Any other recognized
//!   type whose `data` does not fit falls back to [`Message::Unknown`].

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    errors::{ProtocolError, Result},
    frame,
    payloads::{
        ErrorNotice, Heartbeat, KeyRevoked, Ping, Pong, StatusReport, StatusRequest, Welcome,
    },
};

/// Envelope `type` strings.
pub mod kind {
    /// Server greeting after admission
    pub const WELCOME: &str = "welcome";
    /// Liveness beacon (both directions)
    pub const HEARTBEAT: &str = "heartbeat";
    /// Key withdrawal notice
    pub const KEY_REVOKED: &str = "key_revoked";
    /// Client probe
    pub const PING: &str = "ping";
    /// Probe reply
    pub const PONG: &str = "pong";
    /// Status request and report
    pub const STATUS: &str = "status";
    /// Reflection of an unrecognized message
    pub const ECHO: &str = "echo";
    /// Error notice
    pub const ERROR: &str = "error";
    /// Placeholder for envelopes that carry no `type`
    pub const UNKNOWN: &str = "unknown";
}

/// Typed envelope body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server greeting
    Welcome(Welcome),
    /// Liveness beacon
    Heartbeat(Heartbeat),
    /// Key withdrawal notice
    KeyRevoked(KeyRevoked),
    /// Client probe
    Ping(Ping),
    /// Probe reply
    Pong(Pong),
    /// Client status request
    StatusRequest(StatusRequest),
    /// Server status report
    Status(StatusReport),
    /// Reflected `data` of an unrecognized message
    Echo(Value),
    /// Error notice
    Error(ErrorNotice),
    /// Any other `type`, or a server-originated type with unexpected
    /// `data`, kept verbatim
    Unknown {
        /// The unrecognized `type` string
        kind: String,
        /// Raw `data`
        data: Value,
    },
}

impl Message {
    /// Wire `type` string of this message.
    pub fn kind(&self) -> &str {
        match self {
            Self::Welcome(_) => kind::WELCOME,
            Self::Heartbeat(_) => kind::HEARTBEAT,
            Self::KeyRevoked(_) => kind::KEY_REVOKED,
            Self::Ping(_) => kind::PING,
            Self::Pong(_) => kind::PONG,
            Self::StatusRequest(_) | Self::Status(_) => kind::STATUS,
            Self::Echo(_) => kind::ECHO,
            Self::Error(_) => kind::ERROR,
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// The `data` object this message serializes to.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Encode` if the payload fails to serialize
    pub fn data(&self) -> Result<Value> {
        let value = match self {
            Self::Welcome(inner) => serde_json::to_value(inner),
            Self::Heartbeat(inner) => serde_json::to_value(inner),
            Self::KeyRevoked(inner) => serde_json::to_value(inner),
            Self::Ping(inner) => serde_json::to_value(inner),
            Self::Pong(inner) => serde_json::to_value(inner),
            Self::StatusRequest(inner) => serde_json::to_value(inner),
            Self::Status(inner) => serde_json::to_value(inner),
            Self::Echo(data) | Self::Unknown { data, .. } => Ok(data.clone()),
            Self::Error(inner) => serde_json::to_value(inner),
        };
        value.map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn from_parts(kind: String, data: Value) -> Self {
        match kind.as_str() {
            kind::HEARTBEAT => Self::Heartbeat(lenient(data)),
            kind::PING => Self::Ping(lenient(data)),
            kind::STATUS => match strict::<StatusReport>(&data) {
                Some(report) if data.get("connected").is_some() => Self::Status(report),
                _ => Self::StatusRequest(lenient(data)),
            },
            kind::ECHO => Self::Echo(data),
            kind::WELCOME => strict(&data).map(Self::Welcome).unwrap_or(Self::Unknown { kind, data }),
            kind::KEY_REVOKED => {
                strict(&data).map(Self::KeyRevoked).unwrap_or(Self::Unknown { kind, data })
            },
            kind::PONG => strict(&data).map(Self::Pong).unwrap_or(Self::Unknown { kind, data }),
            kind::ERROR => strict(&data).map(Self::Error).unwrap_or(Self::Unknown { kind, data }),
            _ => Self::Unknown { kind, data },
        }
    }
}

/// A message plus the optional top-level timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Typed body
    pub message: Message,
    /// Top-level `timestamp`, omitted on the wire when `None`
    pub timestamp: Option<String>,
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Self { message, timestamp: None }
    }
}

impl Envelope {
    /// Envelope without a top-level timestamp.
    pub fn new(message: Message) -> Self {
        Self::from(message)
    }

    /// Attach a top-level timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Option<String>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Wire `type` string.
    pub fn kind(&self) -> &str {
        self.message.kind()
    }

    /// Serialize to a JSON object.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Encode` if a payload fails to serialize
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let raw = RawEnvelope {
            kind: Some(self.kind().to_string()),
            data: self.message.data()?,
            timestamp: self.timestamp.clone().map(Value::String),
        };
        serde_json::to_vec(&raw).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a JSON object.
    ///
    /// A missing `type` is treated as `"unknown"`; a missing or `null` `data`
    /// as `{}`. A non-string top-level `timestamp` is dropped.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidJson` if `bytes` is not a JSON object
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let raw: RawEnvelope =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let kind = raw.kind.unwrap_or_else(|| kind::UNKNOWN.to_string());
        let data = match raw.data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let timestamp = match raw.timestamp {
            Some(Value::String(ts)) => Some(ts),
            _ => None,
        };

        Ok(Self { message: Message::from_parts(kind, data), timestamp })
    }

    /// Serialize and wrap in a length-prefixed frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Encode` if serialization fails
    /// - `ProtocolError::FrameTooLarge` if the JSON exceeds the frame limit
    pub fn to_frame(&self) -> Result<Bytes> {
        frame::encode_frame(&self.to_json()?)
    }
}

/// Wire shape, before `data` is interpreted.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<Value>,
}

/// Decode `data` into `T`, or `None` if it does not fit.
fn strict<T: DeserializeOwned>(data: &Value) -> Option<T> {
    T::deserialize(data).ok()
}

/// Decode each field of `T` on its own, defaulting the ones that do not fit.
fn lenient<T: DeserializeOwned + Default>(data: Value) -> T {
    let Value::Object(fields) = data else { return T::default() };
    let kept: Map<String, Value> = fields
        .into_iter()
        .filter(|(name, value)| {
            let single = Value::Object(Map::from_iter([(name.clone(), value.clone())]));
            T::deserialize(&single).is_ok()
        })
        .collect();
    T::deserialize(&Value::Object(kept)).unwrap_or_default()
}
