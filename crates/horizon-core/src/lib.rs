//! Event Horizon relay core.
//!
//! Transport-agnostic logic of an end-to-end encrypted messenger relay:
//!
//! - [`credentials`]: signing keys with timed rotation, bearer tokens with
//!   revocation and blacklisting, HMAC identity signatures.
//! - [`registry`]: one live connection per identity, concurrent fan-out and
//!   a liveness monitor that evicts silent peers.
//! - [`session`]: how an admitted connection's inbound envelopes are answered.
//! - [`Relay`]: the service object tying both together, with explicit
//!   `start`/`stop` for its background loops.
//!
//! Sockets are reached through [`ConnectionSink`] and time and randomness
//! through [`Environment`], so the whole core runs under a virtual clock in
//! tests (see `testutil`).

pub mod credentials;
pub mod env;
pub mod error;
pub mod registry;
pub mod relay;
pub mod session;
pub mod task;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use credentials::{
    AuthMethod, Claims, CredentialConfig, CredentialManager, IdentitySignature, IssuedToken,
    RotationInfo, TokenInfo, TokenKind,
};
pub use env::Environment;
pub use error::{
    AdmissionError, AuthFailure, CredentialError, RegistryError, SinkError, TokenRejection,
};
pub use registry::{
    ConnectionId, ConnectionInfo, ConnectionRegistry, ConnectionSink, Delivery, Disconnect,
    RegistryConfig,
};
pub use relay::{Admitted, Relay, RelayConfig, RelayTasks};
pub use session::{InboundOutcome, handle_inbound};
pub use task::{BackgroundTask, ShutdownSignal};
