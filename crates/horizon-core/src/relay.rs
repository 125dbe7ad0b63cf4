//! The relay service object.
//!
//! [`Relay`] bundles the credential manager and the connection registry,
//! constructed once at startup and shared (cheaply cloned) with every
//! connection handler. It is the only entry point the transport and the
//! external request layer need: admission, inbound frame handling, the
//! boolean credential surface and the registry surface.
//!
//! The two components never hold each other's locks. Admission calls the
//! credential manager first and only then touches the registry.

use std::{collections::HashSet, sync::Arc};

use horizon_proto::{ConnectRequest, Envelope, KeyRevoked, Message};
use tracing::{debug, error, info, warn};

use crate::{
    credentials::{
        AuthMethod, Claims, CredentialConfig, CredentialManager, IssuedToken, RotationInfo,
        scheduler::{run_revocation_sweep, run_rotation},
    },
    env::Environment,
    error::{AdmissionError, CredentialError, RegistryError},
    registry::{
        ConnectionId, ConnectionInfo, ConnectionRegistry, ConnectionSink, RegistryConfig,
        liveness::run_liveness,
    },
    session::handle_inbound,
    task::BackgroundTask,
};

/// Text of the `key_revoked` notice.
pub const KEY_REVOKED_MESSAGE: &str = "Public key has been revoked";

/// Relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Connection registry settings
    pub registry: RegistryConfig,
    /// Credential settings
    pub credentials: CredentialConfig,
}

/// A connection that passed admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    /// Registered identity
    pub identity: String,
    /// Registry id of this connection
    pub id: ConnectionId,
    /// How the connection authenticated
    pub method: AuthMethod,
}

/// Connection registry plus credential manager.
pub struct Relay<S, E: Environment> {
    env: E,
    credentials: Arc<CredentialManager<E>>,
    registry: Arc<ConnectionRegistry<S, E>>,
}

impl<S, E: Environment> Clone for Relay<S, E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            credentials: Arc::clone(&self.credentials),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S: ConnectionSink, E: Environment> Relay<S, E> {
    /// Build a relay with a freshly generated signing key.
    ///
    /// # Errors
    ///
    /// - `CredentialError::WeakKeyMaterial` if the RNG output is unusable
    pub fn new(env: E, config: RelayConfig) -> Result<Self, CredentialError> {
        let credentials = Arc::new(CredentialManager::new(env.clone(), config.credentials)?);
        let registry = Arc::new(ConnectionRegistry::new(env.clone(), config.registry));
        Ok(Self { env, credentials, registry })
    }

    /// Credential manager.
    pub fn credentials(&self) -> &Arc<CredentialManager<E>> {
        &self.credentials
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry<S, E>> {
        &self.registry
    }

    /// Authenticate `request` and register `sink` under its identity.
    ///
    /// The caller owns the transport and closes it with
    /// [`AdmissionError::close_code`] on failure.
    ///
    /// # Errors
    ///
    /// - `AdmissionError::Unauthenticated` if authentication fails
    /// - `AdmissionError::Registry` if the accept step or the welcome fails
    pub async fn admit(&self, request: &ConnectRequest, sink: S) -> Result<Admitted, AdmissionError> {
        let method = self.credentials.authenticate(request).inspect_err(|e| {
            warn!(identity = %request.identity, reason = %e, "authentication failed");
        })?;

        let id = self.registry.connect(&request.identity, sink).await?;
        Ok(Admitted { identity: request.identity.clone(), id, method })
    }

    /// Handle one inbound frame from an admitted connection.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Encode` if the reply cannot be encoded
    pub async fn handle_frame(
        &self,
        identity: &str,
        id: ConnectionId,
        raw: &[u8],
    ) -> Result<(), RegistryError> {
        self.registry.record_inbound(identity, id).await;

        let outcome = handle_inbound(identity, raw, &self.env.iso_timestamp());
        if outcome.refresh_heartbeat {
            self.registry.refresh_heartbeat(identity, id).await;
        }
        if let Some(reply) = outcome.reply {
            debug!(identity, kind = reply.kind(), "replying");
            self.registry.send_to(identity, id, &reply).await?;
        }
        Ok(())
    }

    /// Drop connection `id` of `identity` after its read side ended.
    pub async fn release(&self, identity: &str, id: ConnectionId) -> bool {
        self.registry.release(identity, id).await
    }

    /// Issue an access token with the default lifetime.
    ///
    /// # Errors
    ///
    /// - `CredentialError::Signing` if encoding fails
    pub fn issue(&self, subject: &str) -> Result<IssuedToken, CredentialError> {
        self.credentials.issue(subject, None)
    }

    /// Claims of a valid token, `None` otherwise.
    pub fn verify_token(&self, token: &str) -> Option<Claims> {
        self.credentials
            .verify(token)
            .inspect_err(|reason| debug!(%reason, "token verification failed"))
            .ok()
    }

    /// Revoke a token. False if it is not decodable under a retained key.
    pub fn revoke_token(&self, token: &str) -> bool {
        self.credentials.revoke(token).is_ok()
    }

    /// Blacklist a raw token string. Always true.
    pub fn blacklist_token(&self, token: &str) -> bool {
        self.credentials.blacklist(token);
        true
    }

    /// Key rotation status.
    pub fn rotation_info(&self) -> RotationInfo {
        self.credentials.rotation_info()
    }

    /// Send `envelope` to `identity`. True if it was written.
    pub async fn deliver(&self, identity: &str, envelope: &Envelope) -> bool {
        match self.registry.send(identity, envelope).await {
            Ok(delivery) => delivery.is_delivered(),
            Err(e) => {
                error!(identity, error = %e, "failed to encode envelope");
                false
            },
        }
    }

    /// Send `envelope` to everyone except `exclude`. Returns the delivered count.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<&str>) -> usize {
        match self.registry.broadcast(envelope, exclude).await {
            Ok(delivered) => delivered,
            Err(e) => {
                error!(kind = envelope.kind(), error = %e, "failed to encode broadcast");
                0
            },
        }
    }

    /// Tell every other connection that `identity` withdrew its public key.
    pub async fn announce_key_revoked(&self, identity: &str) -> usize {
        let notice = Envelope::new(Message::KeyRevoked(KeyRevoked {
            did: identity.to_string(),
            message: KEY_REVOKED_MESSAGE.to_string(),
            timestamp: self.env.iso_timestamp(),
        }));
        let delivered = self.broadcast(&notice, Some(identity)).await;
        info!(identity, delivered, "announced key revocation");
        delivered
    }

    /// Connected identities.
    pub async fn connected_identities(&self) -> HashSet<String> {
        self.registry.identities().await
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.count().await
    }

    /// Metadata for `identity`, `None` if not connected.
    pub async fn connection_info(&self, identity: &str) -> Option<ConnectionInfo> {
        self.registry.info(identity).await
    }

    /// Spawn the liveness monitor, rotation scheduler and revocation sweeper.
    pub fn start(&self) -> RelayTasks {
        let liveness = {
            let (env, registry) = (self.env.clone(), Arc::clone(&self.registry));
            BackgroundTask::spawn("liveness", move |s| run_liveness(env, registry, s))
        };
        let rotation = {
            let (env, credentials) = (self.env.clone(), Arc::clone(&self.credentials));
            BackgroundTask::spawn("rotation", move |s| run_rotation(env, credentials, s))
        };
        let sweeper = {
            let (env, credentials) = (self.env.clone(), Arc::clone(&self.credentials));
            BackgroundTask::spawn("revocation-sweep", move |s| {
                run_revocation_sweep(env, credentials, s)
            })
        };

        info!("relay background tasks started");
        RelayTasks { tasks: vec![liveness, rotation, sweeper] }
    }

    /// Close every live connection with "going away".
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

/// Handles to the relay's background loops.
#[derive(Debug)]
pub struct RelayTasks {
    tasks: Vec<BackgroundTask>,
}

impl RelayTasks {
    /// Names of the running tasks.
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(BackgroundTask::name).collect()
    }

    /// Signal every loop to stop and wait for all of them.
    pub async fn stop(self) {
        futures::future::join_all(self.tasks.into_iter().map(BackgroundTask::stop)).await;
        info!("relay background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use horizon_proto::{CloseCode, kind};

    use super::*;
    use crate::{
        error::AuthFailure,
        testutil::{MockSink, SimEnv},
    };

    fn relay() -> Relay<MockSink, SimEnv> {
        Relay::new(SimEnv::with_seed(21), RelayConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn admission_failure_maps_to_close_codes() {
        let relay = relay();

        let (sink, peer) = MockSink::pair();
        let err = relay.admit(&ConnectRequest::anonymous("did:a"), sink).await.unwrap_err();
        assert_eq!(err, AdmissionError::Unauthenticated(AuthFailure::MissingCredentials));
        assert_eq!(err.close_code(), CloseCode::PolicyViolation);
        assert!(peer.envelopes().is_empty());

        let token = relay.issue("did:a").unwrap().token;
        let (sink, peer) = MockSink::pair();
        peer.fail_accept(true);
        let err = relay.admit(&ConnectRequest::with_token("did:a", token), sink).await.unwrap_err();
        assert_eq!(err.close_code(), CloseCode::TryAgainLater);
        assert_eq!(relay.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_answered_through_registry() {
        let relay = relay();
        let token = relay.issue("did:a").unwrap().token;
        let (sink, peer) = MockSink::pair();
        let admitted = relay.admit(&ConnectRequest::with_token("did:a", token), sink).await.unwrap();
        assert_eq!(admitted.method, AuthMethod::Token);

        relay.handle_frame("did:a", admitted.id, br#"{"type":"ping","data":{}}"#).await.unwrap();
        relay.handle_frame("did:a", admitted.id, b"not json").await.unwrap();
        relay.handle_frame("did:a", admitted.id, br#"{"type":"heartbeat"}"#).await.unwrap();

        assert_eq!(peer.kinds(), vec![kind::WELCOME, kind::PONG, kind::ERROR]);
        assert!(relay.connected_identities().await.contains("did:a"));
        // welcome + 2 replies out, 3 frames in
        assert_eq!(relay.connection_info("did:a").await.unwrap().message_count, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn boolean_credential_surface() {
        let relay = relay();
        let token = relay.issue("did:a").unwrap().token;

        assert!(relay.verify_token(&token).is_some());
        assert!(!relay.revoke_token("garbage"));
        assert!(relay.revoke_token(&token));
        assert!(relay.verify_token(&token).is_none());
        assert!(relay.blacklist_token("garbage"));
        assert_eq!(relay.rotation_info().current_generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_background_tasks() {
        let relay = relay();
        let tasks = relay.start();
        assert_eq!(tasks.names(), vec!["liveness", "rotation", "revocation-sweep"]);
        tasks.stop().await;
    }
}
