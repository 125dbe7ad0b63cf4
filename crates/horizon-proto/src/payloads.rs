//! Statically shaped `data` objects for each envelope type.
//!
//! Inbound payloads default every field so that `{}` or a missing `data`
//! decodes; outbound payloads are always fully populated by the server.
//! Timestamps a client sends are echoed back untouched, so they are kept as
//! raw JSON values rather than strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Greeting sent to a connection right after admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Human-readable greeting
    pub message: String,
    /// Identity the connection was admitted as
    pub did: String,
    /// Server time (ISO-8601)
    pub timestamp: String,
}

/// Liveness beacon.
///
/// The server broadcasts it periodically; a client sends it back to refresh
/// its liveness. Client beacons may omit the timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender time (ISO-8601)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Notice that an identity's public key was withdrawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRevoked {
    /// Identity whose key was revoked
    pub did: String,
    /// Human-readable notice
    pub message: String,
    /// Server time (ISO-8601)
    pub timestamp: String,
}

/// Client round-trip probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Client time in whatever form the client chose, echoed in the pong
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Reply to [`Ping`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Timestamp copied from the ping (`null` if the ping had none)
    pub timestamp: Option<Value>,
}

/// Client request for its connection status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {
    /// Client time, echoed back in the report
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Reply to [`StatusRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Always `true`: only admitted connections can ask
    pub connected: bool,
    /// Identity the connection is registered under
    pub identity: String,
    /// Echoed request timestamp, or server time when the request had none
    pub timestamp: Value,
}

/// Error notice. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// What went wrong
    pub message: String,
}

impl ErrorNotice {
    /// Message sent when an inbound frame is not a JSON object.
    pub const INVALID_JSON: &'static str = "Invalid JSON format";

    /// Create an error notice.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
