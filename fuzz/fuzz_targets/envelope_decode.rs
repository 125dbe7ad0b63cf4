//! Fuzz target for inbound envelope handling
//!
//! Feeds arbitrary bytes through the same path a client frame takes after
//! admission: JSON envelope decoding and the inbound dispatch.
//!
//! # Invariants
//!
//! - Decoding never panics; invalid input is an error
//! - Every non-heartbeat frame gets exactly one reply
//! - Every reply re-encodes into a valid frame

#![no_main]

use horizon_core::handle_inbound;
use horizon_proto::{Envelope, decode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Envelope::from_json(data);

    let outcome = handle_inbound("did:fuzz", data, "2024-01-01T00:00:00.000000Z");
    assert!(
        outcome.refresh_heartbeat != outcome.reply.is_some(),
        "a frame must either refresh liveness or be answered"
    );

    if let Some(reply) = outcome.reply {
        let frame = reply.to_frame().expect("replies must encode");
        let (payload, rest) = decode_frame(&frame).expect("encoded frame must decode");
        assert!(rest.is_empty());
        Envelope::from_json(payload).expect("reply must decode");
    }
});
