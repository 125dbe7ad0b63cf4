//! Liveness monitor: periodic heartbeat broadcast plus stale eviction.
//!
//! Each tick broadcasts a `heartbeat` envelope to every connection, then
//! evicts connections whose last heartbeat refresh is older than the
//! liveness timeout. Outbound traffic never refreshes liveness; only a
//! heartbeat from the peer does.

use std::sync::Arc;

use horizon_proto::{Envelope, Heartbeat, Message};
use tracing::{debug, error, info};

use super::{ConnectionRegistry, ConnectionSink};
use crate::{env::Environment, task::ShutdownSignal};

/// Run the liveness loop until shutdown.
pub async fn run_liveness<S: ConnectionSink, E: Environment>(
    env: E,
    registry: Arc<ConnectionRegistry<S, E>>,
    mut shutdown: ShutdownSignal,
) {
    let interval = registry.config().heartbeat_interval;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = env.sleep(interval) => {}
        }

        let heartbeat = Envelope::new(Message::Heartbeat(Heartbeat {
            timestamp: Some(env.iso_timestamp()),
        }));
        match registry.broadcast(&heartbeat, None).await {
            Ok(delivered) => debug!(delivered, "heartbeat broadcast"),
            Err(e) => error!(error = %e, "heartbeat broadcast failed"),
        }

        let evicted = registry.sweep_stale().await;
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted stale connections");
        }
    }

    info!("liveness monitor stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use horizon_proto::{CloseCode, kind};

    use super::*;
    use crate::{
        registry::RegistryConfig,
        task::BackgroundTask,
        testutil::{MockSink, SimEnv},
    };

    #[tokio::test(start_paused = true)]
    async fn silent_connection_evicted_active_one_kept() {
        let env = SimEnv::with_seed(1);
        let registry = Arc::new(ConnectionRegistry::new(env.clone(), RegistryConfig::default()));
        let (quiet, quiet_peer) = MockSink::pair();
        let (chatty, chatty_peer) = MockSink::pair();
        registry.connect("did:quiet", quiet).await.unwrap();
        let chatty_id = registry.connect("did:chatty", chatty).await.unwrap();

        let task = {
            let (env, registry) = (env.clone(), Arc::clone(&registry));
            BackgroundTask::spawn("liveness", move |s| run_liveness(env, registry, s))
        };

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            registry.refresh_heartbeat("did:chatty", chatty_id).await;
        }
        task.stop().await;

        assert_eq!(quiet_peer.close_code(), Some(CloseCode::StaleConnection));
        assert!(registry.info("did:chatty").await.is_some());
        assert!(!chatty_peer.is_closed());
        assert!(chatty_peer.kinds().iter().filter(|k| *k == kind::HEARTBEAT).count() >= 5);
    }
}
