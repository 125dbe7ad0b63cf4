//! Fuzz target for bearer token verification
//!
//! Arbitrary strings, and mutations of a genuine token, are presented to a
//! credential manager with a fixed signing key.
//!
//! # Invariants
//!
//! - Verification and inspection never panic
//! - A mutated token that still verifies carries the original claims

#![no_main]

use std::sync::OnceLock;

use arbitrary::Arbitrary;
use horizon_core::{
    CredentialConfig, CredentialManager,
    credentials::{KEY_SIZE, KeyMaterial},
    testutil::SimEnv,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Input {
    Raw(String),
    Mutated { position: usize, byte: u8 },
    Truncated(usize),
}

struct Fixture {
    manager: CredentialManager<SimEnv>,
    token: String,
}

fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let material = KeyMaterial::from_bytes([0x5a; KEY_SIZE]).expect("fixed key is valid");
        let manager =
            CredentialManager::with_key(SimEnv::with_seed(0), CredentialConfig::default(), material);
        let token = manager.issue("did:fuzz", None).expect("issue").token;
        Fixture { manager, token }
    })
}

fuzz_target!(|input: Input| {
    let fixture = fixture();

    let candidate = match input {
        Input::Raw(s) => s,
        Input::Mutated { position, byte } => {
            let mut bytes = fixture.token.clone().into_bytes();
            let index = position % bytes.len();
            bytes[index] = byte;
            String::from_utf8_lossy(&bytes).into_owned()
        },
        Input::Truncated(len) => {
            fixture.token.chars().take(len % fixture.token.len()).collect()
        },
    };

    let verified = fixture.manager.verify(&candidate);
    // base64url padding bits can make two encodings decode identically
    if let Ok(claims) = &verified {
        assert_eq!(claims.sub, "did:fuzz");
    }
    let _ = fixture.manager.inspect(&candidate);
});
