//! Error types for the relay core.
//!
//! One enum per concern: credential operations, token verification,
//! connection authentication, socket I/O, registry operations and admission.
//! Only [`AdmissionError`] reaches the transport, where it becomes a close
//! code; the rest are handled inside the core or surfaced as booleans.

use horizon_proto::{CloseCode, ProtocolError};
use thiserror::Error;

/// Errors from credential management operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Token could not be decoded under any retained key
    #[error("token is not decodable under any retained key")]
    InvalidToken,

    /// The RNG produced key material that must not be used
    #[error("generated key material failed the strength check")]
    WeakKeyMaterial,

    /// Token or signature encoding failed
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Why a bearer token failed verification.
///
/// Variants are listed in the order they are checked: the first that applies
/// is reported.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenRejection {
    /// Token string is on the permanent blacklist
    #[error("token is blacklisted")]
    Blacklisted,

    /// Token was revoked and has not yet expired
    #[error("token has been revoked")]
    Revoked,

    /// No retained key validates the signature
    #[error("invalid token signature")]
    InvalidSignature,

    /// Token is not an access token
    #[error("wrong token type")]
    WrongType,

    /// Token is past its expiry
    #[error("token has expired")]
    Expired,
}

/// Why a connection request was not authenticated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Bearer token was rejected
    #[error("token rejected: {0}")]
    Token(#[from] TokenRejection),

    /// Token subject does not match the requested identity
    #[error("token subject does not match identity")]
    SubjectMismatch,

    /// Identity does not have the required prefix
    #[error("invalid identity format")]
    InvalidIdentity,

    /// Signature timestamp is not ISO-8601
    #[error("malformed signature timestamp")]
    MalformedTimestamp,

    /// Signature timestamp is outside the replay window
    #[error("signature timestamp outside replay window")]
    StaleTimestamp,

    /// HMAC does not match
    #[error("invalid identity signature")]
    InvalidSignature,

    /// Neither a token nor a signature was supplied
    #[error("no credentials supplied")]
    MissingCredentials,
}

/// A socket handle failed. The connection is considered broken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Peer or transport already closed the connection
    #[error("connection closed")]
    Closed,

    /// Write did not complete within the send timeout
    #[error("send timed out")]
    Timeout,

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors from registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The accept step of a new connection failed
    #[error("accept failed: {0}")]
    AcceptFailed(SinkError),

    /// The welcome envelope could not be written; nothing is registered
    #[error("welcome failed: {0}")]
    WelcomeFailed(SinkError),

    /// An outbound envelope could not be encoded
    #[error("encode failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Why a connection was not admitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Authentication failed
    #[error("authentication failed: {0}")]
    Unauthenticated(#[from] AuthFailure),

    /// The connection could not be registered
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AdmissionError {
    /// Close code the transport should use for this rejection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Unauthenticated(_) => CloseCode::PolicyViolation,
            Self::Registry(RegistryError::AcceptFailed(_)) => CloseCode::TryAgainLater,
            Self::Registry(RegistryError::WelcomeFailed(_) | RegistryError::Encode(_)) => {
                CloseCode::InternalError
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_close_codes_are_distinct() {
        let auth = AdmissionError::from(AuthFailure::MissingCredentials).close_code();
        let accept =
            AdmissionError::from(RegistryError::AcceptFailed(SinkError::Closed)).close_code();
        let internal = AdmissionError::from(RegistryError::Encode(ProtocolError::Encode(
            "x".to_string(),
        )))
        .close_code();
        let welcome =
            AdmissionError::from(RegistryError::WelcomeFailed(SinkError::Timeout)).close_code();

        assert_eq!(auth, CloseCode::PolicyViolation);
        assert_eq!(accept, CloseCode::TryAgainLater);
        assert_eq!(internal, CloseCode::InternalError);
        assert_eq!(welcome, CloseCode::InternalError);
    }

    #[test]
    fn token_rejection_converts_to_auth_failure() {
        let failure: AuthFailure = TokenRejection::Expired.into();
        assert_eq!(failure, AuthFailure::Token(TokenRejection::Expired));
    }
}
