//! Horizon production server.
//!
//! Wraps the transport-agnostic [`horizon_core::Relay`] with Quinn QUIC
//! transport, Tokio and the system environment.
//!
//! # Components
//!
//! - [`Server`]: accept loop, handshake, per-connection read loop, lifecycle
//! - [`QuinnTransport`]: QUIC endpoint via Quinn
//! - [`QuicSink`]: the relay's socket handle for one QUIC connection
//! - [`SystemEnv`]: production environment (real time, crypto RNG)
//!
//! # Connection lifecycle
//!
//! 1. QUIC handshake completes; connections beyond `max_connections` are
//!    closed with "try again later".
//! 2. The client opens a bidirectional stream and sends its connect request
//!    as the first frame, within the handshake timeout.
//! 3. The relay authenticates it and registers a [`QuicSink`]; failures
//!    close the connection with the matching close code.
//! 4. Every further frame on the stream is handed to the relay until the
//!    client finishes the stream or the connection drops, then the
//!    registration is released.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod sink;
mod system_env;
mod transport;

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub use error::ServerError;
use horizon_core::{Relay, RelayConfig};
use horizon_proto::{CloseCode, ConnectRequest};
pub use sink::QuicSink;
pub use system_env::SystemEnv;
pub use transport::{QuinnConnection, QuinnTransport, read_frame};
use tracing::{debug, info, warn};

/// The relay as run by the production server.
pub type ServerRelay = Relay<QuicSink, SystemEnv>;

/// Default maximum number of concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Default time a client has to present its connect request.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a single outbound write.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Connections beyond this are closed with "try again later"
    pub max_connections: usize,
    /// Time allowed between QUIC handshake and the connect request
    pub handshake_timeout: Duration,
    /// Bound on a single outbound write
    pub send_timeout: Duration,
    /// Registry and credential settings
    pub relay: RelayConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            relay: RelayConfig::default(),
        }
    }
}

/// Per-connection limits shared by every connection task.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_connections: usize,
    handshake_timeout: Duration,
    send_timeout: Duration,
}

/// Production Horizon server.
pub struct Server {
    relay: ServerRelay,
    transport: QuinnTransport,
    limits: Limits,
    active: Arc<AtomicUsize>,
}

impl Server {
    /// Create the relay and bind the QUIC endpoint.
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let relay = Relay::new(SystemEnv::new(), config.relay)?;
        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )?;

        Ok(Self {
            relay,
            transport,
            limits: Limits {
                max_connections: config.max_connections,
                handshake_timeout: config.handshake_timeout,
                send_timeout: config.send_timeout,
            },
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The relay, for issuing tokens and announcing key revocations.
    pub fn relay(&self) -> &ServerRelay {
        &self.relay
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Run until the endpoint closes.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves, then stop the background loops, close
    /// every connection with "going away" and drain the endpoint.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!(addr = %self.transport.local_addr()?, "server starting");
        let tasks = self.relay.start();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                },
                incoming = self.transport.accept() => {
                    let Some(incoming) = incoming else {
                        warn!("endpoint closed");
                        break;
                    };
                    let relay = self.relay.clone();
                    let active = Arc::clone(&self.active);
                    let limits = self.limits;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(incoming, relay, limits, active).await {
                            debug!(error = %e, "connection ended with error");
                        }
                    });
                },
            }
        }

        tasks.stop().await;
        self.relay.shutdown().await;
        self.transport.shutdown(CloseCode::GoingAway).await;
        info!("server stopped");
        Ok(())
    }
}

/// Counts a live connection against `max_connections` until dropped.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self { active: Arc::clone(active) })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle a single QUIC connection from handshake to release.
async fn handle_connection(
    incoming: quinn::Incoming,
    relay: ServerRelay,
    limits: Limits,
    active: Arc<AtomicUsize>,
) -> Result<(), ServerError> {
    let conn = QuinnConnection::establish(incoming).await?;
    let remote = conn.remote_addr();

    let Some(_slot) = ConnectionSlot::acquire(&active, limits.max_connections) else {
        warn!(%remote, max = limits.max_connections, "connection limit reached");
        conn.close(CloseCode::TryAgainLater, "server full");
        return Ok(());
    };

    let (mut recv, request) =
        match tokio::time::timeout(limits.handshake_timeout, read_connect_request(&conn)).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                warn!(%remote, error = %e, "invalid connect request");
                conn.close(CloseCode::PolicyViolation, "invalid connect request");
                return Err(e);
            },
            Err(_) => {
                warn!(%remote, "handshake timed out");
                conn.close(CloseCode::PolicyViolation, "handshake timeout");
                return Ok(());
            },
        };

    let sink = QuicSink::new(conn.clone(), limits.send_timeout);
    let admitted = match relay.admit(&request, sink).await {
        Ok(admitted) => admitted,
        Err(e) => {
            conn.close(e.close_code(), &e.to_string());
            return Ok(());
        },
    };
    let identity = admitted.identity;
    let id = admitted.id;
    debug!(%remote, identity = %identity, connection = %id, method = ?admitted.method, "read loop started");

    loop {
        match read_frame(&mut recv).await {
            Ok(Some(payload)) => {
                if let Err(e) = relay.handle_frame(&identity, id, &payload).await {
                    warn!(identity = %identity, error = %e, "failed to answer frame");
                }
            },
            Ok(None) => {
                debug!(identity = %identity, "client finished stream");
                break;
            },
            Err(ServerError::Protocol(reason)) => {
                warn!(identity = %identity, %reason, "malformed frame, closing");
                conn.close(CloseCode::PolicyViolation, "malformed frame");
                break;
            },
            Err(e) => {
                debug!(identity = %identity, error = %e, "read loop ended");
                break;
            },
        }
    }

    relay.release(&identity, id).await;
    Ok(())
}

/// Accept the client stream and decode its first frame.
async fn read_connect_request(
    conn: &QuinnConnection,
) -> Result<(quinn::RecvStream, ConnectRequest), ServerError> {
    // The client-to-server half is the only one used.
    let (_send, mut recv) = conn.accept_bi().await?;
    let payload = read_frame(&mut recv)
        .await?
        .ok_or_else(|| ServerError::Protocol("stream finished before connect request".to_string()))?;
    let request = ConnectRequest::from_json(&payload)?;
    Ok((recv, request))
}
