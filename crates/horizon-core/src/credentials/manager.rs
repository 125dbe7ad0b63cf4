//! Token issuance, verification, revocation and key rotation.
//!
//! All mutable credential state (key ring, revocation set, blacklist, last
//! rotation time) sits behind a single `RwLock` that is held only for the
//! lookup or mutation itself. Token decoding and HMAC work run on a key
//! snapshot taken under the lock and released before any crypto.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Lock poisoning should cause a panic")]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use horizon_proto::ConnectRequest;
use tracing::{info, warn};

use super::{
    AuthMethod, CredentialConfig, IdentitySignature, IssuedToken, RotationInfo, TokenInfo,
    keyring::{KeyGeneration, KeyMaterial, KeyRing},
    signature,
    token::{self, Claims, TokenKind},
};
use crate::{
    env::Environment,
    error::{AuthFailure, CredentialError, TokenRejection},
};

/// Mutable credential state.
struct CredentialState {
    keys: KeyRing,
    /// Revoked token -> its `exp` (Unix seconds)
    revoked: HashMap<String, i64>,
    blacklisted: HashSet<String>,
    /// Blacklist entries cleared by a rotation -> generation retired by it.
    /// Kept only while that generation is still in the ring.
    retired_blacklist: HashMap<String, u64>,
    last_rotation: DateTime<Utc>,
}

impl CredentialState {
    fn is_blacklisted(&self, token: &str) -> bool {
        self.blacklisted.contains(token) || self.retired_blacklist.contains_key(token)
    }
}

/// Issues and verifies credentials for connection admission.
///
/// # Invariants
///
/// - Verification tries the current key first, then retired keys.
/// - A blacklisted or revoked token never verifies, whatever its signature.
/// - Rotation clears both the revocation set and the blacklist: a new trust
///   root forces every client to re-authenticate. Cleared blacklist entries
///   still reject their token for as long as the key that could have signed
///   it is retained, so a blacklisted string never verifies again.
pub struct CredentialManager<E: Environment> {
    env: E,
    config: CredentialConfig,
    state: RwLock<CredentialState>,
}

impl<E: Environment> CredentialManager<E> {
    /// Create a manager with a freshly generated signing key.
    ///
    /// # Errors
    ///
    /// - `CredentialError::WeakKeyMaterial` if the RNG output is unusable
    pub fn new(env: E, config: CredentialConfig) -> Result<Self, CredentialError> {
        let material = KeyMaterial::generate(&env)?;
        Ok(Self::with_key(env, config, material))
    }

    /// Create a manager whose first signing key is `material`.
    pub fn with_key(env: E, config: CredentialConfig, material: KeyMaterial) -> Self {
        let now = env.wall_clock();
        let state = CredentialState {
            keys: KeyRing::new(material, now, config.max_previous_keys),
            revoked: HashMap::new(),
            blacklisted: HashSet::new(),
            retired_blacklist: HashMap::new(),
            last_rotation: now,
        };
        Self { env, config, state: RwLock::new(state) }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, CredentialState> {
        self.state.read().expect("CredentialManager lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, CredentialState> {
        self.state.write().expect("CredentialManager lock poisoned")
    }

    fn current_key(&self) -> Arc<KeyGeneration> {
        self.read().keys.current()
    }

    fn decode_any(&self, token: &str) -> Option<Claims> {
        let candidates = self.read().keys.candidates();
        candidates.iter().find_map(|key| token::decode(token, key))
    }

    /// Issue an access token for `subject`.
    ///
    /// `ttl` defaults to the configured token lifetime.
    ///
    /// # Errors
    ///
    /// - `CredentialError::Signing` if encoding fails
    pub fn issue(&self, subject: &str, ttl: Option<Duration>) -> Result<IssuedToken, CredentialError> {
        let ttl = ttl.unwrap_or(self.config.token_ttl);
        let now = self.env.wall_clock();
        let iat = now.timestamp();
        let exp = iat.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));

        let claims = Claims {
            sub: subject.to_string(),
            iat,
            exp,
            jti: format!("{:032x}", self.env.random_u128()),
            kind: TokenKind::Access,
        };

        let key = self.current_key();
        let token = token::encode(&claims, &key)?;

        info!(subject, jti = %claims.jti, generation = key.id(), "issued access token");

        Ok(IssuedToken {
            token,
            token_type: "bearer",
            expires_in: ttl.as_secs(),
            expires_at: claims.expires_at().unwrap_or(DateTime::<Utc>::MAX_UTC),
            jti: claims.jti,
        })
    }

    /// Verify a bearer token.
    ///
    /// # Errors
    ///
    /// The first applicable [`TokenRejection`], checked in declaration order.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenRejection> {
        let candidates = {
            let state = self.read();
            if state.is_blacklisted(token) {
                return Err(TokenRejection::Blacklisted);
            }
            if state.revoked.contains_key(token) {
                return Err(TokenRejection::Revoked);
            }
            state.keys.candidates()
        };

        let claims = candidates
            .iter()
            .find_map(|key| token::decode(token, key))
            .ok_or(TokenRejection::InvalidSignature)?;

        if claims.kind != TokenKind::Access {
            return Err(TokenRejection::WrongType);
        }
        if claims.is_expired_at(self.env.wall_clock()) {
            return Err(TokenRejection::Expired);
        }
        Ok(claims)
    }

    /// Revoke a token until its natural expiry.
    ///
    /// The token must decode under a retained key; its expiry is ignored.
    ///
    /// # Errors
    ///
    /// - `CredentialError::InvalidToken` if no retained key validates it
    pub fn revoke(&self, token: &str) -> Result<(), CredentialError> {
        let claims = self.decode_any(token).ok_or(CredentialError::InvalidToken)?;

        self.write().revoked.insert(token.to_string(), claims.exp);

        info!(subject = %claims.sub, jti = %claims.jti, "revoked token");
        Ok(())
    }

    /// Permanently reject a raw token string. Always succeeds.
    pub fn blacklist(&self, token: &str) {
        self.write().blacklisted.insert(token.to_string());
        info!("blacklisted token");
    }

    /// True while `token` is revoked and not yet past its expiry.
    pub fn is_revoked(&self, token: &str) -> bool {
        let now_ms = self.env.wall_clock().timestamp_millis();
        self.read().revoked.get(token).is_some_and(|&exp| !expired(exp, now_ms))
    }

    /// True if `token` is blacklisted, including entries cleared by a
    /// rotation whose signing key is still retained.
    pub fn is_blacklisted(&self, token: &str) -> bool {
        self.read().is_blacklisted(token)
    }

    /// Entries in the revocation set, including ones awaiting purge.
    pub fn revoked_count(&self) -> usize {
        self.read().revoked.len()
    }

    /// Entries on the blacklist since the last rotation.
    pub fn blacklisted_count(&self) -> usize {
        self.read().blacklisted.len()
    }

    /// Drop revocations whose token has expired. Returns how many were removed.
    pub fn purge_expired_revocations(&self) -> usize {
        let now_ms = self.env.wall_clock().timestamp_millis();
        let mut state = self.write();
        let before = state.revoked.len();
        state.revoked.retain(|_, &mut exp| !expired(exp, now_ms));
        before - state.revoked.len()
    }

    /// Replace the signing key.
    ///
    /// Retires the current key, evicts the oldest retired key past the
    /// configured maximum and clears both the revocation set and blacklist.
    ///
    /// # Errors
    ///
    /// - `CredentialError::WeakKeyMaterial` if new key material is unusable;
    ///   the ring is left untouched
    pub fn rotate(&self) -> Result<RotationInfo, CredentialError> {
        let material = KeyMaterial::generate(&self.env)?;
        let now = self.env.wall_clock();

        let (info, cleared_revoked, cleared_blacklisted) = {
            let mut state = self.write();
            let retiring = state.keys.current().id();
            state.keys.rotate(material, now);
            let cleared_revoked = std::mem::take(&mut state.revoked).len();

            let cleared = std::mem::take(&mut state.blacklisted);
            let cleared_blacklisted = cleared.len();
            state.retired_blacklist.extend(cleared.into_iter().map(|token| (token, retiring)));
            let oldest = state.keys.oldest_generation();
            state.retired_blacklist.retain(|_, generation| *generation >= oldest);

            state.last_rotation = now;
            (self.info_from(&state), cleared_revoked, cleared_blacklisted)
        };

        info!(
            generation = info.current_generation,
            retained = info.retained_key_count,
            cleared_revoked,
            cleared_blacklisted,
            "rotated signing key"
        );
        Ok(info)
    }

    /// Rotation status.
    pub fn rotation_info(&self) -> RotationInfo {
        self.info_from(&self.read())
    }

    /// Time left until the next rotation is due, zero if overdue.
    pub fn time_until_rotation(&self) -> Duration {
        let next = self.rotation_info().next_rotation;
        (next - self.env.wall_clock()).to_std().unwrap_or(Duration::ZERO)
    }

    fn info_from(&self, state: &CredentialState) -> RotationInfo {
        let interval = chrono::Duration::from_std(self.config.rotation_interval)
            .unwrap_or(chrono::Duration::MAX);
        RotationInfo {
            last_rotation: state.last_rotation,
            next_rotation: state
                .last_rotation
                .checked_add_signed(interval)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            interval: self.config.rotation_interval,
            retained_key_count: state.keys.previous_count(),
            total_keys: state.keys.total_keys(),
            current_generation: state.keys.current().id(),
        }
    }

    /// Decode a token under any retained key and report its state.
    ///
    /// Unlike [`Self::verify`] this never rejects an expired, revoked or
    /// blacklisted token; it reports the flags instead.
    ///
    /// # Errors
    ///
    /// - `CredentialError::InvalidToken` if no retained key validates it
    pub fn inspect(&self, token: &str) -> Result<TokenInfo, CredentialError> {
        let claims = self.decode_any(token).ok_or(CredentialError::InvalidToken)?;
        let now = self.env.wall_clock();
        let remaining = claims.exp.saturating_sub(now.timestamp());

        Ok(TokenInfo {
            is_expired: claims.is_expired_at(now),
            is_revoked: self.is_revoked(token),
            is_blacklisted: self.is_blacklisted(token),
            expires_in: u64::try_from(remaining).unwrap_or(0),
            issued_at: claims.issued_at(),
            expires_at: claims.expires_at(),
            subject: claims.sub,
            kind: claims.kind,
            jti: claims.jti,
        })
    }

    /// Sign `identity` at the current time with the current key.
    ///
    /// # Errors
    ///
    /// - `CredentialError::Signing` if the MAC cannot be computed
    pub fn sign_identity(&self, identity: &str) -> Result<IdentitySignature, CredentialError> {
        let timestamp = self.env.wall_clock().to_rfc3339_opts(SecondsFormat::Secs, true);
        let signature = signature::sign(&self.current_key(), identity, &timestamp)?;
        Ok(IdentitySignature {
            signature,
            timestamp,
            expires_in: self.config.replay_window.as_secs(),
        })
    }

    /// Check an identity signature.
    ///
    /// Does not consult the revocation set or blacklist.
    ///
    /// # Errors
    ///
    /// - `AuthFailure::MalformedTimestamp` if `timestamp` is not ISO-8601
    /// - `AuthFailure::StaleTimestamp` if it is outside the replay window in
    ///   either direction: too old, or dated further ahead than the window
    /// - `AuthFailure::InvalidSignature` if the HMAC does not match
    pub fn verify_signature(
        &self,
        identity: &str,
        timestamp: &str,
        signature: &str,
    ) -> Result<(), AuthFailure> {
        let signed_at =
            signature::parse_timestamp(timestamp).ok_or(AuthFailure::MalformedTimestamp)?;

        let skew = (self.env.wall_clock() - signed_at).abs();
        let window =
            chrono::Duration::from_std(self.config.replay_window).unwrap_or(chrono::Duration::MAX);
        if skew > window {
            return Err(AuthFailure::StaleTimestamp);
        }

        if !signature::verify(&self.current_key(), identity, timestamp, signature) {
            return Err(AuthFailure::InvalidSignature);
        }
        Ok(())
    }

    /// Authenticate a connection request.
    ///
    /// A token takes precedence over a signature. With neither, the request
    /// is rejected unless `allow_unauthenticated` is set.
    ///
    /// # Errors
    ///
    /// The [`AuthFailure`] describing the first failed check.
    pub fn authenticate(&self, request: &ConnectRequest) -> Result<AuthMethod, AuthFailure> {
        let identity = request.identity.as_str();
        if !identity.starts_with(&self.config.identity_prefix) {
            return Err(AuthFailure::InvalidIdentity);
        }

        if let Some(token) = &request.token {
            let claims = self.verify(token)?;
            if claims.sub != identity {
                return Err(AuthFailure::SubjectMismatch);
            }
            return Ok(AuthMethod::Token);
        }

        if let (Some(signature), Some(timestamp)) = (&request.signature, &request.timestamp) {
            self.verify_signature(identity, timestamp, signature)?;
            return Ok(AuthMethod::Signature);
        }

        if self.config.allow_unauthenticated {
            warn!(identity, "admitting connection without credentials");
            return Ok(AuthMethod::Unauthenticated);
        }
        Err(AuthFailure::MissingCredentials)
    }
}

fn expired(exp: i64, now_ms: i64) -> bool {
    now_ms > exp.saturating_mul(1000)
}
