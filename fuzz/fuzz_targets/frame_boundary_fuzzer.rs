//! Fuzz target for length-prefix boundary conditions
//!
//! # Strategy
//!
//! - Declared size: zero, small, at the limit, just over, `u32::MAX`, random
//! - Body: shorter than, equal to, or longer than the declared size
//!
//! # Invariants
//!
//! - A declared size above `MAX_FRAME_SIZE` MUST return
//!   `ProtocolError::FrameTooLarge` without allocating the body
//! - A body shorter than declared MUST return `ProtocolError::Truncated`
//! - A complete frame splits into exactly the declared payload and the rest

#![no_main]

use arbitrary::Arbitrary;
use horizon_proto::{MAX_FRAME_SIZE, ProtocolError, decode_frame};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum DeclaredSize {
    Zero,
    Small(u8),
    AtMax,
    JustOverMax,
    MaxU32,
    Random(u32),
}

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryFrame {
    size: DeclaredSize,
    body: Vec<u8>,
}

fuzz_target!(|input: BoundaryFrame| {
    let declared: u32 = match input.size {
        DeclaredSize::Zero => 0,
        DeclaredSize::Small(s) => u32::from(s),
        DeclaredSize::AtMax => MAX_FRAME_SIZE as u32,
        DeclaredSize::JustOverMax => MAX_FRAME_SIZE as u32 + 1,
        DeclaredSize::MaxU32 => u32::MAX,
        DeclaredSize::Random(n) => n,
    };

    let mut buf = declared.to_be_bytes().to_vec();
    buf.extend_from_slice(&input.body);

    match decode_frame(&buf) {
        Ok((payload, rest)) => {
            assert_eq!(payload.len(), declared as usize);
            assert_eq!(payload.len() + rest.len(), input.body.len());
        },
        Err(ProtocolError::FrameTooLarge { size, .. }) => {
            assert!(size > MAX_FRAME_SIZE);
        },
        Err(ProtocolError::Truncated { .. }) => {
            assert!(input.body.len() < declared as usize);
        },
        Err(e) => panic!("unexpected error: {e}"),
    }
});
