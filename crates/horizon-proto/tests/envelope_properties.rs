//! Property-based tests for envelope parsing and framing
//!
//! The relay reads envelopes from untrusted peers, so decoding must reject
//! garbage with an error instead of panicking, and opaque chat traffic must
//! pass through without being altered.

use horizon_proto::{
    Envelope, Message, ProtocolError, decode_frame, encode_frame, kind, MAX_FRAME_SIZE,
};
use proptest::prelude::*;
use serde_json::{Value, json};

/// Strategy for `type` strings the relay does not interpret
fn opaque_kind() -> impl Strategy<Value = String> {
    "[a-z_]{1,16}".prop_filter("recognized type", |k| {
        ![
            kind::WELCOME,
            kind::HEARTBEAT,
            kind::KEY_REVOKED,
            kind::PING,
            kind::PONG,
            kind::STATUS,
            kind::ECHO,
            kind::ERROR,
        ]
        .contains(&k.as_str())
    })
}

/// Strategy for small JSON objects with string and integer leaves
fn json_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,8}", prop_oneof![
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,32}".prop_map(Value::from),
    ], 0..6)
    .prop_map(|map| Value::Object(map.into_iter().collect()))
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Envelope::from_json(&bytes);
        let _ = decode_frame(&bytes);
    }

    #[test]
    fn opaque_traffic_passes_through(kind in opaque_kind(), data in json_object(), ts in proptest::option::of("[0-9T:-]{1,25}")) {
        let wire = json!({"type": kind, "data": data, "timestamp": ts}).to_string();
        let env = Envelope::from_json(wire.as_bytes()).unwrap();

        prop_assert_eq!(env.message.clone(), Message::Unknown { kind: kind.clone(), data: data.clone() });
        prop_assert_eq!(env.timestamp.clone(), ts);

        let again = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        prop_assert_eq!(again, env);
    }

    #[test]
    fn frames_split_at_declared_boundaries(payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..8)) {
        let mut wire = Vec::new();
        for payload in &payloads {
            wire.extend_from_slice(&encode_frame(payload).unwrap());
        }

        let mut rest = wire.as_slice();
        for payload in &payloads {
            let (got, tail) = decode_frame(rest).unwrap();
            prop_assert_eq!(got, payload.as_slice());
            rest = tail;
        }
        prop_assert!(rest.is_empty());
    }

    #[test]
    fn cut_frames_report_truncation(payload in prop::collection::vec(any::<u8>(), 1..256), cut in 1usize..256) {
        let frame = encode_frame(&payload).unwrap();
        let cut = cut.min(frame.len() - 1);
        let result = decode_frame(&frame[..cut]);
        prop_assert!(matches!(result, Err(ProtocolError::Truncated { .. })), "expected truncation");
    }
}

#[test]
fn oversized_frames_rejected_by_prefix_alone() {
    let declared = u32::try_from(MAX_FRAME_SIZE + 1).unwrap().to_be_bytes();
    assert!(matches!(decode_frame(&declared), Err(ProtocolError::FrameTooLarge { .. })));
}
