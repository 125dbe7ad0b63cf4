//! Wire protocol for the Event Horizon relay.
//!
//! Clients talk to the relay over QUIC. Every message is a length-prefixed
//! JSON frame (see [`frame`]). The first frame a client sends is a
//! [`ConnectRequest`]; every frame after that, in either direction, is an
//! [`Envelope`].
//!
//! Message bodies are opaque to the relay beyond their `type`: end-to-end
//! encrypted chat traffic passes through as [`Message::Unknown`].

pub mod close;
pub mod envelope;
pub mod errors;
pub mod frame;
pub mod handshake;
pub mod payloads;

pub use close::CloseCode;
pub use envelope::{Envelope, Message, kind};
pub use errors::{ProtocolError, Result};
pub use frame::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, decode_frame, encode_frame};
pub use handshake::ConnectRequest;
pub use payloads::{
    ErrorNotice, Heartbeat, KeyRevoked, Ping, Pong, StatusReport, StatusRequest, Welcome,
};

/// ALPN protocol identifier negotiated on every connection.
pub const ALPN_PROTOCOL: &[u8] = b"horizon";
