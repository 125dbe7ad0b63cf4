//! Signing key generations and the bounded ring that retains them.
//!
//! A [`KeyGeneration`] is immutable once created. Rotation does not mutate
//! the current key in place: it swaps in a new `Arc<KeyGeneration>` and
//! retires the old one, so a reader holding the previous `Arc` keeps a
//! consistent snapshot.

use std::{collections::VecDeque, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use zeroize::Zeroizing;

use crate::{env::Environment, error::CredentialError};

/// Size of generated key material in bytes (512 bits).
pub const KEY_SIZE: usize = 64;

/// Secret key bytes, zeroed on drop.
pub struct KeyMaterial(Zeroizing<[u8; KEY_SIZE]>);

impl KeyMaterial {
    /// Draw fresh key material from the environment RNG.
    ///
    /// # Errors
    ///
    /// - `CredentialError::WeakKeyMaterial` if the RNG returned all zeroes
    pub fn generate<E: Environment>(env: &E) -> Result<Self, CredentialError> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        env.random_bytes(bytes.as_mut_slice());
        Self::checked(bytes)
    }

    /// Wrap caller-provided key bytes.
    ///
    /// # Errors
    ///
    /// - `CredentialError::WeakKeyMaterial` if `bytes` is all zeroes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Result<Self, CredentialError> {
        Self::checked(Zeroizing::new(bytes))
    }

    fn checked(bytes: Zeroizing<[u8; KEY_SIZE]>) -> Result<Self, CredentialError> {
        if bytes.iter().all(|&b| b == 0) {
            return Err(CredentialError::WeakKeyMaterial);
        }
        Ok(Self(bytes))
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// One signing key plus the time it became current.
pub struct KeyGeneration {
    id: u64,
    material: KeyMaterial,
    created_at: DateTime<Utc>,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyGeneration {
    /// Build a generation from key material.
    pub fn new(id: u64, material: KeyMaterial, created_at: DateTime<Utc>) -> Self {
        let encoding = EncodingKey::from_secret(material.expose());
        let decoding = DecodingKey::from_secret(material.expose());
        Self { id, material, created_at, encoding, decoding }
    }

    /// Monotonic generation number (the first key is generation 1).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When this generation became current.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn material(&self) -> &[u8] {
        self.material.expose()
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl fmt::Debug for KeyGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGeneration")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Current signing key plus a bounded set of retired keys.
///
/// # Invariants
///
/// - Exactly one generation is current.
/// - At most `max_previous` retired generations are kept, newest first.
/// - [`KeyRing::candidates`] always yields the current key first.
#[derive(Debug)]
pub struct KeyRing {
    current: Arc<KeyGeneration>,
    previous: VecDeque<Arc<KeyGeneration>>,
    max_previous: usize,
}

impl KeyRing {
    /// Create a ring whose first generation is `material`.
    pub fn new(material: KeyMaterial, created_at: DateTime<Utc>, max_previous: usize) -> Self {
        Self {
            current: Arc::new(KeyGeneration::new(1, material, created_at)),
            previous: VecDeque::with_capacity(max_previous + 1),
            max_previous,
        }
    }

    /// Snapshot of the current generation.
    pub fn current(&self) -> Arc<KeyGeneration> {
        Arc::clone(&self.current)
    }

    /// Number of retired generations still accepted for verification.
    pub fn previous_count(&self) -> usize {
        self.previous.len()
    }

    /// Current plus retired generations.
    pub fn total_keys(&self) -> usize {
        1 + self.previous.len()
    }

    /// Make `material` current and retire the old key.
    ///
    /// Drops the oldest retired generation once more than `max_previous`
    /// are held. Returns the new current generation.
    pub fn rotate(&mut self, material: KeyMaterial, now: DateTime<Utc>) -> Arc<KeyGeneration> {
        let next = Arc::new(KeyGeneration::new(self.current.id + 1, material, now));
        let retired = std::mem::replace(&mut self.current, Arc::clone(&next));

        self.previous.push_front(retired);
        self.previous.truncate(self.max_previous);

        next
    }

    /// Generation number of the oldest key still accepted.
    pub fn oldest_generation(&self) -> u64 {
        self.previous.back().map_or(self.current.id, |k| k.id)
    }

    /// Keys to try when verifying, current first.
    pub fn candidates(&self) -> Vec<Arc<KeyGeneration>> {
        std::iter::once(Arc::clone(&self.current))
            .chain(self.previous.iter().cloned())
            .collect()
    }
}
