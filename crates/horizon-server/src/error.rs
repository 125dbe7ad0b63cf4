//! Server error types.

use std::fmt;

use horizon_core::CredentialError;
use horizon_proto::ProtocolError;

/// Errors that can occur in the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, missing TLS certs, etc.).
    ///
    /// Fatal at startup. Fix configuration and restart.
    Config(String),

    /// Transport/network error (connection failure, stream I/O, etc.).
    ///
    /// Transient for a single connection, fatal if the endpoint itself failed.
    Transport(String),

    /// Protocol error (bad framing, malformed connect request).
    ///
    /// Fatal for that connection; the server keeps serving other clients.
    Protocol(String),

    /// Credential setup failed (no usable signing key).
    Credentials(CredentialError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Credentials(err) => write!(f, "credential error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Credentials(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CredentialError> for ServerError {
    fn from(err: CredentialError) -> Self {
        Self::Credentials(err)
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
