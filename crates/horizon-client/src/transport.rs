//! Connection setup and the channel/stream bridge.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use horizon_proto::{
    CloseCode, ConnectRequest, Envelope, LENGTH_PREFIX_SIZE, ProtocolError, encode_frame,
    frame::payload_len,
};
use quinn::{ClientConfig, Endpoint, ReadExactError, RecvStream, SendStream};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default idle timeout of the client connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel capacity in each direction.
const CHANNEL_CAPACITY: usize = 32;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Handle to a client connected to the relay.
///
/// Envelopes are sent and received through the channels; internal tasks
/// handle the QUIC I/O. Dropping the handle leaves the connection open until
/// [`ConnectedClient::stop`] or the idle timeout.
pub struct ConnectedClient {
    /// Send envelopes to the relay.
    pub to_server: mpsc::Sender<Envelope>,
    /// Receive envelopes from the relay.
    pub from_server: mpsc::Receiver<Envelope>,
    connection: quinn::Connection,
    // Keeps the socket driver alive for the lifetime of the client.
    _endpoint: Endpoint,
}

impl ConnectedClient {
    /// Send one envelope.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.to_server
            .send(envelope)
            .await
            .map_err(|_| TransportError::Stream("connection task stopped".to_string()))
    }

    /// Next envelope from the relay, `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.from_server.recv().await
    }

    /// Wait for the connection to close and report the relay's close code.
    ///
    /// `None` if the connection ended some other way (timeout, local close,
    /// unknown code).
    pub async fn closed(&self) -> Option<CloseCode> {
        match self.connection.closed().await {
            quinn::ConnectionError::ApplicationClosed(close) => {
                u32::try_from(close.error_code.into_inner()).ok().and_then(CloseCode::from_code)
            },
            other => {
                debug!(reason = %other, "connection ended");
                None
            },
        }
    }

    /// Close the connection.
    pub fn stop(&self) {
        self.connection.close(
            quinn::VarInt::from_u32(CloseCode::Normal.code()),
            CloseCode::Normal.default_reason().as_bytes(),
        );
    }
}

/// Connect to a relay and present `request`.
///
/// Accepts any server certificate, see [`connect_with`].
pub async fn connect(
    server_addr: &str,
    request: &ConnectRequest,
) -> Result<ConnectedClient, TransportError> {
    connect_with(server_addr, request, insecure_client_config()?).await
}

/// Connect to a relay with an explicit QUIC client configuration.
pub async fn connect_with(
    server_addr: &str,
    request: &ConnectRequest,
    config: ClientConfig,
) -> Result<ConnectedClient, TransportError> {
    let addr: SocketAddr = server_addr
        .parse()
        .map_err(|e| TransportError::Connection(format!("invalid address: {e}")))?;

    let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
        .map_err(|e| TransportError::Connection(format!("endpoint creation failed: {e}")))?;
    endpoint.set_default_client_config(config);

    let connection = endpoint
        .connect(addr, "localhost")
        .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?
        .await
        .map_err(|e| TransportError::Connection(format!("connection failed: {e}")))?;

    let (mut send, _recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::Stream(format!("open_bi failed: {e}")))?;
    write_frame(&mut send, encode_frame(&request.to_json()?)?).await?;

    let (to_server_tx, to_server_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);
    let (from_server_tx, from_server_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

    tokio::spawn(run_outbound(send, to_server_rx));
    tokio::spawn(run_inbound(connection.clone(), from_server_tx));

    Ok(ConnectedClient {
        to_server: to_server_tx,
        from_server: from_server_rx,
        connection,
        _endpoint: endpoint,
    })
}

/// Write queued envelopes to the client stream until the channel closes.
async fn run_outbound(mut send: SendStream, mut to_server: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = to_server.recv().await {
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unencodable envelope");
                continue;
            },
        };
        if let Err(e) = write_frame(&mut send, frame).await {
            debug!(error = %e, "outbound stream closed");
            return;
        }
    }
    let _ = send.finish();
}

/// Forward envelopes from the relay's stream into the channel.
async fn run_inbound(connection: quinn::Connection, from_server: mpsc::Sender<Envelope>) {
    let mut recv = match connection.accept_uni().await {
        Ok(recv) => recv,
        Err(e) => {
            debug!(error = %e, "no relay stream");
            return;
        },
    };

    loop {
        let payload = match read_frame(&mut recv).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "relay stream ended");
                return;
            },
        };
        match Envelope::from_json(&payload) {
            Ok(envelope) => {
                if from_server.send(envelope).await.is_err() {
                    return;
                }
            },
            Err(e) => warn!(error = %e, "undecodable envelope from relay"),
        }
    }
}

async fn write_frame(send: &mut SendStream, frame: Bytes) -> Result<(), TransportError> {
    send.write_all(&frame).await.map_err(|e| TransportError::Stream(format!("write failed: {e}")))
}

/// Read one length-prefixed frame, `None` on a clean end of stream.
async fn read_frame(recv: &mut RecvStream) -> Result<Option<Vec<u8>>, TransportError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match recv.read_exact(&mut prefix).await {
        Ok(()) => {},
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(TransportError::Stream(format!("prefix read failed: {e}"))),
    }

    let mut payload = vec![0u8; payload_len(prefix)?];
    recv.read_exact(&mut payload)
        .await
        .map_err(|e| TransportError::Stream(format!("payload read failed: {e}")))?;
    Ok(Some(payload))
}

/// Create an insecure client config that accepts any certificate.
///
/// WARNING: Development only. Production should verify certificates.
fn insecure_client_config() -> Result<ClientConfig, TransportError> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();

    // Must match server's ALPN protocol
    crypto.alpn_protocols = vec![horizon_proto::ALPN_PROTOCOL.to_vec()];

    let mut config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| TransportError::Connection(format!("invalid TLS config: {e}")))?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .map_err(|e| TransportError::Connection(format!("invalid idle timeout: {e}")))?,
    ));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

/// Certificate verifier that accepts any certificate (insecure, for
/// development).
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_address() {
        let result = connect("not an address", &ConnectRequest::anonymous("did:a")).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[test]
    fn insecure_config_builds() {
        assert!(insecure_client_config().is_ok());
    }
}
