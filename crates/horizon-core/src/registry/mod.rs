//! Live connections: one addressable socket per identity.
//!
//! [`ConnectionRegistry`] maps identities to socket handles and fans
//! envelopes out to them. The liveness loop in [`liveness`] keeps it free of
//! dead peers. Sockets are reached only through [`ConnectionSink`], so the
//! registry is independent of the transport.

mod connection;
pub mod liveness;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
pub use connection::ConnectionRegistry;
use horizon_proto::CloseCode;

use crate::error::SinkError;

/// Default interval between server heartbeats (30 seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default maximum gap since a connection's last heartbeat (90 seconds).
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);

/// Default greeting sent on admission.
pub const DEFAULT_WELCOME_MESSAGE: &str = "Welcome to Event Horizon Chat!";

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between heartbeat broadcasts and liveness sweeps
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are evicted
    pub liveness_timeout: Duration,
    /// Text of the welcome envelope
    pub welcome_message: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
        }
    }
}

/// Write half of a live connection, exclusively owned by the registry.
///
/// Implementations must be cheap to call concurrently: broadcast sends to
/// every recipient at once.
#[async_trait]
pub trait ConnectionSink: Send + Sync + 'static {
    /// Complete the transport accept step. Called once, before registration.
    async fn accept(&self) -> Result<(), SinkError>;

    /// Write one encoded frame.
    async fn send(&self, frame: Bytes) -> Result<(), SinkError>;

    /// Close the connection. Closing an already closed sink is not an error.
    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SinkError>;
}

/// Distinguishes successive connections of the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// Raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of a connection's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Registered identity
    pub identity: String,
    /// Connection id
    pub id: ConnectionId,
    /// Admission time
    pub connected_at: DateTime<Utc>,
    /// Last heartbeat refresh (admission time until the first one)
    pub last_heartbeat: DateTime<Utc>,
    /// Inbound plus outbound messages
    pub message_count: u64,
}

/// Outcome of a direct send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame was written
    Delivered,
    /// No connection for the identity
    NotConnected,
    /// Write failed; the connection was dropped
    SendFailed,
}

impl Delivery {
    /// True for [`Delivery::Delivered`].
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Outcome of a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The identity was connected and has been removed
    Removed,
    /// The identity was not connected
    Absent,
}
