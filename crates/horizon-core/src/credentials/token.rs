//! Bearer token claims and HS256 encoding.
//!
//! The JWT decoder checks only the signature. Expiry and type are checked by
//! the manager, in a fixed order, and revocation decodes expired tokens.

use std::fmt;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};

use super::keyring::KeyGeneration;
use crate::error::CredentialError;

/// Token type tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Connection access token, the only kind the relay accepts
    Access,
    /// Any other or missing tag
    #[default]
    #[serde(other)]
    Other,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Other => f.write_str("other"),
        }
    }
}

/// Claims embedded in every issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identity
    pub sub: String,
    /// Issued-at (Unix seconds)
    pub iat: i64,
    /// Expiry (Unix seconds)
    pub exp: i64,
    /// Unique token id
    pub jti: String,
    /// Token type tag
    #[serde(rename = "type", default)]
    pub kind: TokenKind,
}

impl Claims {
    /// True once `now` is strictly past the expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() > self.exp.saturating_mul(1000)
    }

    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    /// Issue time as a timestamp.
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.iat, 0)
    }
}

pub(crate) fn encode(claims: &Claims, key: &KeyGeneration) -> Result<String, CredentialError> {
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, key.encoding_key())
        .map_err(|e| CredentialError::Signing(e.to_string()))
}

/// Decode and check the signature against one key. Expiry is not checked.
pub(crate) fn decode(token: &str, key: &KeyGeneration) -> Option<Claims> {
    jsonwebtoken::decode::<Claims>(token, key.decoding_key(), &validation())
        .ok()
        .map(|data| data.claims)
}

fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}
