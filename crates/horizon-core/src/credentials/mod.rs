//! Credential lifecycle: signing keys, bearer tokens, identity signatures.
//!
//! [`CredentialManager`] owns the [`KeyRing`] and the revocation and
//! blacklist sets behind one lock. Two background loops keep it current:
//! the rotation scheduler and the revocation sweeper (see [`scheduler`]).

mod keyring;
mod manager;
pub mod scheduler;
mod signature;
mod token;

use std::time::Duration;

use chrono::{DateTime, Utc};
pub use keyring::{KEY_SIZE, KeyGeneration, KeyMaterial, KeyRing};
pub use manager::CredentialManager;
use serde::Serialize;
pub use signature::parse_timestamp;
pub use token::{Claims, TokenKind};

/// Default access token lifetime (30 minutes).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Default key rotation interval (24 hours).
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of retired keys kept for verification.
pub const DEFAULT_MAX_PREVIOUS_KEYS: usize = 3;

/// Default interval between revocation purges (5 minutes).
pub const DEFAULT_REVOCATION_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default delay before retrying a failed rotation (5 minutes).
pub const DEFAULT_ROTATION_RETRY_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Default signature replay window (5 minutes).
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default required identity prefix.
pub const DEFAULT_IDENTITY_PREFIX: &str = "did:";

/// Credential manager configuration.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Lifetime of tokens issued without an explicit TTL
    pub token_ttl: Duration,
    /// Time between key rotations, measured from the last rotation
    pub rotation_interval: Duration,
    /// Retired keys kept for verification
    pub max_previous_keys: usize,
    /// How often expired revocations are purged
    pub revocation_sweep_interval: Duration,
    /// Delay before retrying a failed rotation
    pub rotation_retry_backoff: Duration,
    /// Maximum age (and future skew) of a signature timestamp
    pub replay_window: Duration,
    /// Prefix every identity must carry (empty disables the check)
    pub identity_prefix: String,
    /// Admit connections with no credentials at all. Development only.
    pub allow_unauthenticated: bool,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            token_ttl: DEFAULT_TOKEN_TTL,
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            max_previous_keys: DEFAULT_MAX_PREVIOUS_KEYS,
            revocation_sweep_interval: DEFAULT_REVOCATION_SWEEP_INTERVAL,
            rotation_retry_backoff: DEFAULT_ROTATION_RETRY_BACKOFF,
            replay_window: DEFAULT_REPLAY_WINDOW,
            identity_prefix: DEFAULT_IDENTITY_PREFIX.to_string(),
            allow_unauthenticated: false,
        }
    }
}

/// A freshly issued access token.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    /// Encoded token
    pub token: String,
    /// Always `"bearer"`
    pub token_type: &'static str,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Unique token id
    pub jti: String,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("jti", &self.jti)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Decoded view of a token, including its revocation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    /// Subject identity
    pub subject: String,
    /// Issue time
    pub issued_at: Option<DateTime<Utc>>,
    /// Expiry time
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds until expiry, zero once expired
    pub expires_in: u64,
    /// Past expiry
    pub is_expired: bool,
    /// In the revocation set
    pub is_revoked: bool,
    /// On the blacklist
    pub is_blacklisted: bool,
    /// Type tag
    pub kind: TokenKind,
    /// Unique token id
    pub jti: String,
}

/// Key rotation status. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationInfo {
    /// When the current key became active
    pub last_rotation: DateTime<Utc>,
    /// When the next rotation is due
    pub next_rotation: DateTime<Utc>,
    /// Configured rotation interval
    pub interval: Duration,
    /// Retired keys still accepted for verification
    pub retained_key_count: usize,
    /// Current plus retired keys
    pub total_keys: usize,
    /// Generation number of the current key
    pub current_generation: u64,
}

/// Server-issued identity signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySignature {
    /// Hex HMAC over `identity:timestamp`
    pub signature: String,
    /// Signed timestamp
    pub timestamp: String,
    /// Seconds the signature stays inside the replay window
    pub expires_in: u64,
}

/// How a connection request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Valid access token for the identity
    Token,
    /// Valid identity signature inside the replay window
    Signature,
    /// No credentials, admitted by `allow_unauthenticated`
    Unauthenticated,
}
