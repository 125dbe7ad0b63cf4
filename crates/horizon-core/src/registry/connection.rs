//! Identity -> connection map with concurrent fan-out.
//!
//! The map lock is held only to read or mutate entries. Every socket
//! operation (accept, send, close) runs on an `Arc` snapshot of the sink
//! after the lock is released, so one slow peer never stalls admission or
//! removal of others.
//!
//! Entries carry a [`ConnectionId`]. Removal paths that can race with a
//! reconnect (a failed send, the end of a read loop) remove only when the id
//! still matches, so they never take down the connection that replaced the
//! one they observed.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use horizon_proto::{CloseCode, Envelope, Message, Welcome};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ConnectionId, ConnectionInfo, ConnectionSink, Delivery, Disconnect, RegistryConfig};
use crate::{
    env::Environment,
    error::{RegistryError, SinkError},
};

struct Entry<S, I> {
    id: ConnectionId,
    sink: Arc<S>,
    connected_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    /// Monotonic time of the last heartbeat, drives eviction
    last_heartbeat: I,
    message_count: u64,
}

impl<S, I> Entry<S, I> {
    fn info(&self, identity: &str) -> ConnectionInfo {
        ConnectionInfo {
            identity: identity.to_string(),
            id: self.id,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat_at,
            message_count: self.message_count,
        }
    }
}

/// Registry of live connections, at most one per identity.
///
/// # Invariants
///
/// - At most one entry per identity. Admitting an identity that is already
///   connected closes and replaces the old connection.
/// - No socket I/O happens while the map lock is held.
/// - A failed send removes the connection it was sent on.
pub struct ConnectionRegistry<S, E: Environment> {
    env: E,
    config: RegistryConfig,
    next_id: AtomicU64,
    connections: RwLock<HashMap<String, Entry<S, E::Instant>>>,
}

impl<S: ConnectionSink, E: Environment> ConnectionRegistry<S, E> {
    /// Create an empty registry.
    pub fn new(env: E, config: RegistryConfig) -> Self {
        Self { env, config, next_id: AtomicU64::new(1), connections: RwLock::new(HashMap::new()) }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a connection for `identity`.
    ///
    /// Runs the sink's accept step, registers the connection (closing any
    /// previous one for the same identity) and sends it a welcome envelope.
    ///
    /// # Errors
    ///
    /// - `RegistryError::AcceptFailed` if the accept step fails; nothing is
    ///   registered
    /// - `RegistryError::WelcomeFailed` if the welcome write fails; the
    ///   connection is closed and removed again
    /// - `RegistryError::Encode` if the welcome envelope cannot be encoded
    pub async fn connect(&self, identity: &str, sink: S) -> Result<ConnectionId, RegistryError> {
        if let Err(e) = sink.accept().await {
            warn!(identity, error = %e, "connection accept failed");
            return Err(RegistryError::AcceptFailed(e));
        }

        let welcome = Envelope::new(Message::Welcome(Welcome {
            message: self.config.welcome_message.clone(),
            did: identity.to_string(),
            timestamp: self.env.iso_timestamp(),
        }))
        .to_frame()?;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sink = Arc::new(sink);
        let now = self.env.wall_clock();
        let entry = Entry {
            id,
            sink: Arc::clone(&sink),
            connected_at: now,
            last_heartbeat_at: now,
            last_heartbeat: self.env.now(),
            message_count: 0,
        };

        let replaced = self.connections.write().await.insert(identity.to_string(), entry);

        if let Some(old) = replaced {
            warn!(identity, old = %old.id, new = %id, "replacing existing connection");
            if let Err(e) = old.sink.close(CloseCode::Normal, "replaced by new connection").await {
                debug!(identity, error = %e, "closing replaced connection failed");
            }
        }

        self.send_on(identity, id, &sink, welcome).await.map_err(RegistryError::WelcomeFailed)?;

        info!(identity, connection = %id, "connection admitted");
        Ok(id)
    }

    /// Remove `identity` and close its socket. Idempotent.
    pub async fn disconnect(&self, identity: &str) -> Disconnect {
        let removed = self.connections.write().await.remove(identity);
        let Some(entry) = removed else {
            return Disconnect::Absent;
        };

        info!(identity, connection = %entry.id, "connection removed");
        if let Err(e) = entry.sink.close(CloseCode::Normal, "disconnected").await {
            debug!(identity, error = %e, "close after disconnect failed");
        }
        Disconnect::Removed
    }

    /// Remove `identity` only if it is still connection `id`.
    ///
    /// Called when a connection's read side ends. The socket is not closed:
    /// the transport already is. Returns whether an entry was removed.
    pub async fn release(&self, identity: &str, id: ConnectionId) -> bool {
        let removed = self.remove_if_current(identity, id).await.is_some();
        if removed {
            info!(identity, connection = %id, "connection released");
        }
        removed
    }

    /// Encode and send `envelope` to `identity`.
    ///
    /// A failed write disconnects the identity.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Encode` if the envelope cannot be encoded
    pub async fn send(&self, identity: &str, envelope: &Envelope) -> Result<Delivery, RegistryError> {
        let frame = envelope.to_frame()?;
        Ok(self.deliver(identity, frame).await)
    }

    /// Encode and send `envelope` on connection `id` of `identity` only.
    ///
    /// Replies to inbound frames go through here so they never reach a
    /// connection that replaced the sender.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Encode` if the envelope cannot be encoded
    pub async fn send_to(
        &self,
        identity: &str,
        id: ConnectionId,
        envelope: &Envelope,
    ) -> Result<Delivery, RegistryError> {
        let frame = envelope.to_frame()?;
        let sink = {
            let connections = self.connections.read().await;
            connections.get(identity).filter(|e| e.id == id).map(|e| Arc::clone(&e.sink))
        };
        let Some(sink) = sink else {
            return Ok(Delivery::NotConnected);
        };
        Ok(self.delivery(identity, id, &sink, frame).await)
    }

    async fn deliver(&self, identity: &str, frame: Bytes) -> Delivery {
        let target = {
            let connections = self.connections.read().await;
            connections.get(identity).map(|e| (e.id, Arc::clone(&e.sink)))
        };
        let Some((id, sink)) = target else {
            return Delivery::NotConnected;
        };
        self.delivery(identity, id, &sink, frame).await
    }

    async fn delivery(&self, identity: &str, id: ConnectionId, sink: &S, frame: Bytes) -> Delivery {
        match self.send_on(identity, id, sink, frame).await {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::SendFailed,
        }
    }

    /// Write `frame` to `sink`, the socket of connection `id`. A failed write
    /// removes that connection.
    async fn send_on(
        &self,
        identity: &str,
        id: ConnectionId,
        sink: &S,
        frame: Bytes,
    ) -> Result<(), SinkError> {
        match sink.send(frame).await {
            Ok(()) => {
                if let Some(entry) = self.connections.write().await.get_mut(identity)
                    && entry.id == id
                {
                    entry.message_count += 1;
                }
                Ok(())
            },
            Err(e) => {
                warn!(identity, connection = %id, error = %e, "send failed, dropping connection");
                self.drop_broken(identity, id).await;
                Err(e)
            },
        }
    }

    /// Send `envelope` to every connection except `exclude`.
    ///
    /// Sends run concurrently on a snapshot of the map. Recipients whose send
    /// fails are disconnected once every send has finished; they do not
    /// affect delivery to others. Returns the number of successful sends.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Encode` if the envelope cannot be encoded
    pub async fn broadcast(
        &self,
        envelope: &Envelope,
        exclude: Option<&str>,
    ) -> Result<usize, RegistryError> {
        let frame = envelope.to_frame()?;

        let targets: Vec<(String, ConnectionId, Arc<S>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(identity, _)| Some(identity.as_str()) != exclude)
                .map(|(identity, e)| (identity.clone(), e.id, Arc::clone(&e.sink)))
                .collect()
        };

        let results = join_all(targets.into_iter().map(|(identity, id, sink)| {
            let frame = frame.clone();
            async move {
                let result = sink.send(frame).await;
                (identity, id, result)
            }
        }))
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let mut connections = self.connections.write().await;
            for (identity, id, result) in results {
                match result {
                    Ok(()) => {
                        delivered += 1;
                        if let Some(entry) = connections.get_mut(&identity)
                            && entry.id == id
                        {
                            entry.message_count += 1;
                        }
                    },
                    Err(e) => {
                        warn!(identity = %identity, connection = %id, error = %e, "broadcast send failed");
                        failed.push((identity, id));
                    },
                }
            }
        }

        for (identity, id) in failed {
            self.drop_broken(&identity, id).await;
        }

        debug!(kind = envelope.kind(), delivered, "broadcast complete");
        Ok(delivered)
    }

    async fn remove_if_current(&self, identity: &str, id: ConnectionId) -> Option<Arc<S>> {
        let mut connections = self.connections.write().await;
        if connections.get(identity).is_some_and(|e| e.id == id) {
            connections.remove(identity).map(|e| e.sink)
        } else {
            None
        }
    }

    async fn drop_broken(&self, identity: &str, id: ConnectionId) {
        if let Some(sink) = self.remove_if_current(identity, id).await
            && let Err(e) = sink.close(CloseCode::InternalError, "send failed").await
        {
            debug!(identity, error = %e, "closing broken connection failed");
        }
    }

    /// Record a heartbeat from connection `id` of `identity`.
    ///
    /// Returns false if that connection is no longer registered.
    pub async fn refresh_heartbeat(&self, identity: &str, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(identity) {
            Some(entry) if entry.id == id => {
                entry.last_heartbeat = self.env.now();
                entry.last_heartbeat_at = self.env.wall_clock();
                true
            },
            _ => false,
        }
    }

    /// Count an inbound message from connection `id` of `identity`.
    pub async fn record_inbound(&self, identity: &str, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(identity)
            && entry.id == id
        {
            entry.message_count += 1;
        }
    }

    /// Evict connections whose last heartbeat is older than the liveness
    /// timeout. Returns the evicted identities.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let now = self.env.now();
        let timeout = self.config.liveness_timeout;

        let stale: Vec<(String, ConnectionId, Arc<S>)> = {
            let mut connections = self.connections.write().await;
            let expired: Vec<String> = connections
                .iter()
                .filter(|(_, e)| now - e.last_heartbeat > timeout)
                .map(|(identity, _)| identity.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|identity| {
                    connections.remove(&identity).map(|e| (identity, e.id, e.sink))
                })
                .collect()
        };

        for (identity, id, sink) in &stale {
            warn!(identity = %identity, connection = %id, "evicting stale connection");
            if let Err(e) = sink.close(CloseCode::StaleConnection, "heartbeat timeout").await {
                debug!(identity = %identity, error = %e, "closing stale connection failed");
            }
        }

        stale.into_iter().map(|(identity, _, _)| identity).collect()
    }

    /// Metadata for `identity`.
    pub async fn info(&self, identity: &str) -> Option<ConnectionInfo> {
        self.connections.read().await.get(identity).map(|e| e.info(identity))
    }

    /// Connection id currently registered for `identity`.
    pub async fn connection_id(&self, identity: &str) -> Option<ConnectionId> {
        self.connections.read().await.get(identity).map(|e| e.id)
    }

    /// Connected identities.
    pub async fn identities(&self) -> HashSet<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Close every connection with "going away". Close failures are logged
    /// and otherwise ignored.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Entry<S, E::Instant>)> =
            self.connections.write().await.drain().collect();
        let count = drained.len();

        join_all(drained.into_iter().map(|(identity, entry)| async move {
            if let Err(e) = entry.sink.close(CloseCode::GoingAway, "server shutting down").await {
                debug!(identity = %identity, error = %e, "close during shutdown failed");
            }
        }))
        .await;

        info!(count, "closed all connections");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use horizon_proto::{Heartbeat, kind};

    use super::*;
    use crate::testutil::{MockSink, SimEnv};

    type Registry = ConnectionRegistry<MockSink, SimEnv>;

    fn registry() -> Registry {
        ConnectionRegistry::new(SimEnv::with_seed(1), RegistryConfig::default())
    }

    fn heartbeat() -> Envelope {
        Envelope::new(Message::Heartbeat(Heartbeat { timestamp: Some("t".to_string()) }))
    }

    #[tokio::test(start_paused = true)]
    async fn connect_sends_welcome_only_to_new_connection() {
        let reg = registry();
        let (a, a_peer) = MockSink::pair();
        let (b, b_peer) = MockSink::pair();

        reg.connect("did:a", a).await.unwrap();
        reg.connect("did:b", b).await.unwrap();

        let a_kinds = a_peer.kinds();
        assert_eq!(a_kinds, vec![kind::WELCOME]);
        let welcome = b_peer.envelopes().remove(0);
        let Message::Welcome(w) = welcome.message else { panic!("expected welcome") };
        assert_eq!(w.did, "did:b");
        assert_eq!(w.message, "Welcome to Event Horizon Chat!");

        let info = reg.info("did:a").await.unwrap();
        assert_eq!(info.message_count, 1);
        assert_eq!(info.connected_at, info.last_heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_failure_rejects_without_registering() {
        let reg = registry();
        let (sink, peer) = MockSink::pair();
        peer.fail_accept(true);

        assert!(matches!(reg.connect("did:a", sink).await, Err(RegistryError::AcceptFailed(_))));
        assert_eq!(reg.count().await, 0);
        assert!(peer.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_welcome_rejects_without_registering() {
        let reg = registry();
        let (sink, peer) = MockSink::pair();
        peer.fail_sends(true);

        let result = reg.connect("did:a", sink).await;

        assert!(matches!(result, Err(RegistryError::WelcomeFailed(_))));
        assert_eq!(reg.count().await, 0);
        assert_eq!(peer.close_code(), Some(CloseCode::InternalError));
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_ignores_replacement() {
        let reg = registry();
        let (first, first_peer) = MockSink::pair();
        let (second, second_peer) = MockSink::pair();
        let old = reg.connect("did:a", first).await.unwrap();
        let new = reg.connect("did:a", second).await.unwrap();

        assert_eq!(reg.send_to("did:a", old, &heartbeat()).await.unwrap(), Delivery::NotConnected);
        assert_eq!(reg.send_to("did:a", new, &heartbeat()).await.unwrap(), Delivery::Delivered);
        assert_eq!(first_peer.kinds(), vec![kind::WELCOME]);
        assert_eq!(second_peer.kinds(), vec![kind::WELCOME, kind::HEARTBEAT]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replaces_and_closes_old_socket() {
        let reg = registry();
        let (first, first_peer) = MockSink::pair();
        let (second, second_peer) = MockSink::pair();

        let old = reg.connect("did:a", first).await.unwrap();
        let new = reg.connect("did:a", second).await.unwrap();

        assert_ne!(old, new);
        assert_eq!(reg.count().await, 1);
        assert_eq!(first_peer.close_code(), Some(CloseCode::Normal));
        assert!(!second_peer.is_closed());
        assert_eq!(reg.connection_id("did:a").await, Some(new));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_release_keeps_replacement() {
        let reg = registry();
        let (first, _) = MockSink::pair();
        let (second, _) = MockSink::pair();
        let old = reg.connect("did:a", first).await.unwrap();
        let new = reg.connect("did:a", second).await.unwrap();

        assert!(!reg.release("did:a", old).await);
        assert_eq!(reg.connection_id("did:a").await, Some(new));
        assert!(reg.release("did:a", new).await);
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let reg = registry();
        let (sink, peer) = MockSink::pair();
        reg.connect("did:a", sink).await.unwrap();

        assert_eq!(reg.disconnect("did:a").await, Disconnect::Removed);
        assert_eq!(reg.disconnect("did:a").await, Disconnect::Absent);
        assert_eq!(reg.disconnect("did:nobody").await, Disconnect::Absent);
        assert!(peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn send_outcomes() {
        let reg = registry();
        let (sink, peer) = MockSink::pair();
        reg.connect("did:a", sink).await.unwrap();

        assert_eq!(reg.send("did:a", &heartbeat()).await.unwrap(), Delivery::Delivered);
        assert_eq!(reg.send("did:z", &heartbeat()).await.unwrap(), Delivery::NotConnected);

        peer.fail_sends(true);
        assert_eq!(reg.send("did:a", &heartbeat()).await.unwrap(), Delivery::SendFailed);
        assert_eq!(reg.count().await, 0);
        assert_eq!(reg.send("did:a", &heartbeat()).await.unwrap(), Delivery::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_skips_excluded_and_prunes_failures() {
        let reg = registry();
        let (a, _a_peer) = MockSink::pair();
        let (b, b_peer) = MockSink::pair();
        let (c, c_peer) = MockSink::pair();
        reg.connect("did:a", a).await.unwrap();
        reg.connect("did:b", b).await.unwrap();
        reg.connect("did:c", c).await.unwrap();
        c_peer.fail_sends(true);

        let delivered = reg.broadcast(&heartbeat(), Some("did:a")).await.unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(b_peer.kinds(), vec![kind::WELCOME, kind::HEARTBEAT]);
        assert_eq!(reg.identities().await, HashSet::from(["did:a".to_string(), "did:b".to_string()]));
        assert_eq!(reg.info("did:b").await.unwrap().message_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_traffic_does_not_refresh_liveness() {
        let reg = registry();
        let (sink, peer) = MockSink::pair();
        reg.connect("did:a", sink).await.unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(30)).await;
            reg.broadcast(&heartbeat(), None).await.unwrap();
        }

        assert_eq!(reg.sweep_stale().await, vec!["did:a".to_string()]);
        assert_eq!(peer.close_code(), Some(CloseCode::StaleConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_refresh_prevents_eviction() {
        let reg = registry();
        let (sink, _) = MockSink::pair();
        let id = reg.connect("did:a", sink).await.unwrap();

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(60)).await;
            assert!(reg.refresh_heartbeat("did:a", id).await);
            assert!(reg.sweep_stale().await.is_empty());
        }
        assert_eq!(reg.count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_boundary_is_strict() {
        let reg = registry();
        let (sink, _) = MockSink::pair();
        reg.connect("did:a", sink).await.unwrap();

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(reg.sweep_stale().await.is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(reg.sweep_stale().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_tolerates_close_failures() {
        let reg = registry();
        let (a, a_peer) = MockSink::pair();
        let (b, b_peer) = MockSink::pair();
        reg.connect("did:a", a).await.unwrap();
        reg.connect("did:b", b).await.unwrap();
        a_peer.fail_close(true);

        reg.shutdown().await;

        assert_eq!(reg.count().await, 0);
        assert_eq!(b_peer.close_code(), Some(CloseCode::GoingAway));
    }
}
