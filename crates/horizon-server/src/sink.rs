//! [`ConnectionSink`] over a QUIC connection.
//!
//! The accept step opens the server-to-client unidirectional stream; every
//! envelope the relay sends afterwards is written to it in order. Writes are
//! bounded by a timeout so one stalled peer cannot hold a broadcast hostage.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use horizon_core::{ConnectionSink, SinkError};
use horizon_proto::CloseCode;
use quinn::SendStream;
use tokio::sync::Mutex;

use crate::transport::QuinnConnection;

/// Socket handle registered with the relay for one QUIC connection.
pub struct QuicSink {
    connection: QuinnConnection,
    outbound: Mutex<Option<SendStream>>,
    send_timeout: Duration,
}

impl QuicSink {
    /// Wrap `connection`. Nothing is opened until the accept step.
    pub fn new(connection: QuinnConnection, send_timeout: Duration) -> Self {
        Self { connection, outbound: Mutex::new(None), send_timeout }
    }
}

#[async_trait]
impl ConnectionSink for QuicSink {
    async fn accept(&self) -> Result<(), SinkError> {
        let stream = self
            .connection
            .open_uni()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        *self.outbound.lock().await = Some(stream);
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<(), SinkError> {
        let mut outbound = self.outbound.lock().await;
        let stream = outbound.as_mut().ok_or(SinkError::Closed)?;

        match tokio::time::timeout(self.send_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(quinn::WriteError::ConnectionLost(_) | quinn::WriteError::ClosedStream)) => {
                Err(SinkError::Closed)
            },
            Ok(Err(e)) => Err(SinkError::Transport(e.to_string())),
            Err(_) => Err(SinkError::Timeout),
        }
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SinkError> {
        if let Some(mut stream) = self.outbound.lock().await.take() {
            // Best effort: the connection close below discards unsent data anyway.
            let _ = stream.finish();
        }
        self.connection.close(code, reason);
        Ok(())
    }
}
