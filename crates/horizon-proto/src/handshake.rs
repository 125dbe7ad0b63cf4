//! Connect request: the first frame a client sends on its stream.
//!
//! Carries the identity plus at most one credential set. A token takes
//! precedence over a signature when both are present.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Client login parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Identity to register under (`did:` prefixed)
    pub identity: String,
    /// Bearer access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Hex HMAC-SHA256 over `identity:timestamp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// ISO-8601 timestamp the signature was computed over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ConnectRequest {
    /// Request carrying no credentials.
    pub fn anonymous(identity: impl Into<String>) -> Self {
        Self { identity: identity.into(), token: None, signature: None, timestamp: None }
    }

    /// Request authenticated by bearer token.
    pub fn with_token(identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self { token: Some(token.into()), ..Self::anonymous(identity) }
    }

    /// Request authenticated by identity signature.
    pub fn with_signature(
        identity: impl Into<String>,
        signature: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            signature: Some(signature.into()),
            timestamp: Some(timestamp.into()),
            ..Self::anonymous(identity)
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Encode` if serialization fails
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidJson` if `bytes` is not a connect request
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

// Credentials stay out of logs.
impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("identity", &self.identity)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("signature", &self.signature.as_ref().map(|_| "<redacted>"))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omits_absent_credentials() {
        let json = String::from_utf8(ConnectRequest::anonymous("did:a").to_json().unwrap()).unwrap();
        insta::assert_snapshot!(json, @r#"{"identity":"did:a"}"#);
    }

    #[test]
    fn debug_redacts_credentials() {
        let req = ConnectRequest::with_token("did:a", "secret-token");
        let debug = format!("{req:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("did:a"));
    }

    #[test]
    fn missing_identity_is_rejected() {
        assert!(ConnectRequest::from_json(br#"{"token":"t"}"#).is_err());
    }
}
