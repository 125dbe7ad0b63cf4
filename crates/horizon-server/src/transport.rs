//! Quinn-based QUIC transport.
//!
//! Encrypted, multiplexed streams over UDP with TLS 1.3. Supports production
//! TLS certificates (PEM files) and self-signed certificates for testing.
//!
//! # Security
//!
//! ALPN is set to `horizon` so only relay clients complete the handshake.
//! Self-signed certificates are only suitable for local testing; production
//! deployments MUST use certificates from a trusted CA.

use std::{net::SocketAddr, sync::Arc};

use horizon_proto::{CloseCode, LENGTH_PREFIX_SIZE, frame::payload_len};
use quinn::{Endpoint, ReadExactError, RecvStream, SendStream, ServerConfig};

use crate::error::ServerError;

/// QUIC transport using Quinn.
pub struct QuinnTransport {
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Create and bind a new QUIC transport.
    ///
    /// If `cert_path` and `key_path` are provided, they will be used for TLS.
    /// Otherwise, a self-signed certificate will be generated for testing.
    pub fn bind(
        address: &str,
        cert_path: Option<&str>,
        key_path: Option<&str>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(cert, key)?,
            _ => generate_self_signed_config()?,
        };

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| ServerError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!(%addr, "QUIC transport bound");

        Ok(Self { endpoint })
    }

    /// Wait for the next incoming connection attempt.
    ///
    /// The QUIC handshake is not awaited here, so a slow client never blocks
    /// the accept loop. Returns `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }

    /// Refuse new connections and close existing ones with `code`, then wait
    /// until every connection has drained.
    pub async fn shutdown(&self, code: CloseCode) {
        self.endpoint.close(quinn::VarInt::from_u32(code.code()), code.default_reason().as_bytes());
        self.endpoint.wait_idle().await;
    }
}

/// A QUIC connection wrapper.
///
/// Clones are cheap and share the same underlying QUIC connection.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Complete the QUIC handshake of an incoming connection.
    pub async fn establish(incoming: quinn::Incoming) -> Result<Self, ServerError> {
        let connection = incoming
            .await
            .map_err(|e| ServerError::Transport(format!("connection failed: {e}")))?;
        Ok(Self { connection })
    }

    /// Accept the client's bidirectional stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| ServerError::Transport(format!("accept_bi failed: {e}")))
    }

    /// Open a unidirectional stream for server-to-client sends.
    pub async fn open_uni(&self) -> Result<SendStream, ServerError> {
        self.connection
            .open_uni()
            .await
            .map_err(|e| ServerError::Transport(format!("open_uni failed: {e}")))
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection with an application close code.
    pub fn close(&self, code: CloseCode, reason: &str) {
        self.connection.close(quinn::VarInt::from_u32(code.code()), reason.as_bytes());
    }
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer finished the stream on a frame boundary.
///
/// # Errors
///
/// - `ServerError::Protocol` if the prefix exceeds the frame limit or the
///   stream ends inside a frame
/// - `ServerError::Transport` if the stream fails
pub async fn read_frame(recv: &mut RecvStream) -> Result<Option<Vec<u8>>, ServerError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match recv.read_exact(&mut prefix).await {
        Ok(()) => {},
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(read_error(e)),
    }

    let len = payload_len(prefix)?;
    let mut payload = vec![0u8; len];
    recv.read_exact(&mut payload).await.map_err(read_error)?;
    Ok(Some(payload))
}

fn read_error(err: ReadExactError) -> ServerError {
    match err {
        ReadExactError::FinishedEarly(read) => {
            ServerError::Protocol(format!("stream ended inside a frame after {read} bytes"))
        },
        ReadExactError::ReadError(e) => ServerError::Transport(format!("read failed: {e}")),
    }
}

/// Load TLS configuration from certificate and key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, ServerError> {
    use std::fs;

    let cert_pem = fs::read(cert_path)
        .map_err(|e| ServerError::Config(format!("failed to read cert '{cert_path}': {e}")))?;

    let key_pem = fs::read(key_path)
        .map_err(|e| ServerError::Config(format!("failed to read key '{key_path}': {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    quic_config(tls_config)
}

/// Generate a self-signed certificate for testing.
fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let cert_chain = vec![cert.cert.der().clone()];
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tracing::warn!("Using self-signed certificate - not for production use!");

    quic_config(tls_config)
}

fn quic_config(mut tls_config: rustls::ServerConfig) -> Result<ServerConfig, ServerError> {
    tls_config.alpn_protocols = vec![horizon_proto::ALPN_PROTOCOL.to_vec()];

    Ok(ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_binds_with_self_signed() {
        let transport = QuinnTransport::bind("127.0.0.1:0", None, None).unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0, "Should have assigned a port");
    }

    #[tokio::test]
    async fn transport_rejects_invalid_address() {
        let result = QuinnTransport::bind("invalid:address:format", None, None);
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn transport_rejects_missing_cert_files() {
        let result =
            QuinnTransport::bind("127.0.0.1:0", Some("/nonexistent/cert.pem"), Some("/nonexistent/key.pem"));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
