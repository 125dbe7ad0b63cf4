//! HMAC identity signatures.
//!
//! A client proves control of an identity by presenting
//! `hex(HMAC-SHA256(current_key, "identity:timestamp"))` together with the
//! timestamp it signed. The relay accepts it only while the timestamp is
//! inside the replay window.

use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::keyring::KeyGeneration;
use crate::error::CredentialError;

type HmacSha256 = Hmac<Sha256>;

fn mac(key: &KeyGeneration, identity: &str, timestamp: &str) -> Result<HmacSha256, CredentialError> {
    let mut mac = HmacSha256::new_from_slice(key.material())
        .map_err(|e| CredentialError::Signing(e.to_string()))?;
    mac.update(identity.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    Ok(mac)
}

/// Hex signature over `identity:timestamp`.
pub(crate) fn sign(
    key: &KeyGeneration,
    identity: &str,
    timestamp: &str,
) -> Result<String, CredentialError> {
    Ok(hex::encode(mac(key, identity, timestamp)?.finalize().into_bytes()))
}

/// Constant-time comparison of `signature` against the expected HMAC.
pub(crate) fn verify(key: &KeyGeneration, identity: &str, timestamp: &str, signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature) else {
        return false;
    };
    match mac(key, identity, timestamp) {
        Ok(mac) => mac.verify_slice(&provided).is_ok(),
        Err(_) => false,
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::credentials::keyring::{KEY_SIZE, KeyMaterial};

    fn key(byte: u8) -> KeyGeneration {
        KeyGeneration::new(
            1,
            KeyMaterial::from_bytes([byte; KEY_SIZE]).unwrap(),
            Utc.timestamp_opt(0, 0).unwrap(),
        )
    }

    #[test]
    fn signature_binds_identity_and_timestamp() {
        let sig = sign(&key(3), "did:a", "2024-01-01T00:00:00").unwrap();

        assert!(verify(&key(3), "did:a", "2024-01-01T00:00:00", &sig));
        assert!(!verify(&key(3), "did:b", "2024-01-01T00:00:00", &sig));
        assert!(!verify(&key(3), "did:a", "2024-01-01T00:00:01", &sig));
        assert!(!verify(&key(4), "did:a", "2024-01-01T00:00:00", &sig));
    }

    #[test]
    fn non_hex_signature_is_rejected() {
        assert!(!verify(&key(3), "did:a", "t", "zz-not-hex"));
    }

    #[test]
    fn parses_offset_and_naive_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T14:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T12:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T12:00:00.000000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
