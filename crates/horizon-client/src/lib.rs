//! QUIC client transport for the Horizon relay.
//!
//! [`connect`] dials the relay, presents a [`ConnectRequest`] and returns a
//! [`ConnectedClient`]: a pair of envelope channels bridged to the QUIC
//! streams by background tasks. This is a thin layer that only moves
//! envelopes; encryption of message bodies happens above it.
//!
//! Stream layout:
//!
//! - one client-opened bidirectional stream carrying the connect request and
//!   then every client envelope
//! - one server-opened unidirectional stream carrying every server envelope

mod transport;

pub use transport::{ConnectedClient, TransportError, connect, connect_with};
