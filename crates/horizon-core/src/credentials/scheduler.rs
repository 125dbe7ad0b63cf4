//! Background loops that keep credential state current.
//!
//! - [`run_rotation`] rotates the signing key once the configured interval
//!   has passed since the last rotation. A failed rotation is logged and
//!   retried after a backoff; the loop never exits on its own.
//! - [`run_revocation_sweep`] drops revocations whose tokens have expired.
//!
//! Both loops exit promptly when their [`ShutdownSignal`] fires.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::CredentialManager;
use crate::{env::Environment, task::ShutdownSignal};

/// Rotate keys on schedule until shutdown.
pub async fn run_rotation<E: Environment>(
    env: E,
    manager: Arc<CredentialManager<E>>,
    mut shutdown: ShutdownSignal,
) {
    let backoff = manager.config().rotation_retry_backoff;

    loop {
        let wait = manager.time_until_rotation();
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = env.sleep(wait) => {}
        }

        match manager.rotate() {
            Ok(info) => {
                debug!(next_rotation = %info.next_rotation, "rotation scheduled");
            },
            Err(e) => {
                error!(error = %e, retry_in = ?backoff, "key rotation failed");
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = env.sleep(backoff) => {}
                }
            },
        }
    }

    info!("rotation scheduler stopped");
}

/// Purge expired revocations periodically until shutdown.
pub async fn run_revocation_sweep<E: Environment>(
    env: E,
    manager: Arc<CredentialManager<E>>,
    mut shutdown: ShutdownSignal,
) {
    let interval = manager.config().revocation_sweep_interval;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = env.sleep(interval) => {}
        }

        let purged = manager.purge_expired_revocations();
        if purged > 0 {
            debug!(purged, "purged expired revocations");
        }
    }

    info!("revocation sweeper stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{credentials::CredentialConfig, task::BackgroundTask, testutil::SimEnv};

    fn config() -> CredentialConfig {
        CredentialConfig {
            rotation_interval: Duration::from_secs(3600),
            rotation_retry_backoff: Duration::from_secs(60),
            revocation_sweep_interval: Duration::from_secs(30),
            ..CredentialConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_after_interval() {
        let env = SimEnv::with_seed(1);
        let manager = Arc::new(CredentialManager::new(env.clone(), config()).unwrap());

        let task = {
            let (env, manager) = (env.clone(), Arc::clone(&manager));
            BackgroundTask::spawn("rotation", move |s| run_rotation(env, manager, s))
        };

        tokio::time::sleep(Duration::from_secs(3599)).await;
        assert_eq!(manager.rotation_info().current_generation, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.rotation_info().current_generation, 2);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(manager.rotation_info().current_generation, 3);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rotation_retries_after_backoff() {
        let env = SimEnv::with_seed(2);
        let manager = Arc::new(CredentialManager::new(env.clone(), config()).unwrap());
        env.set_zero_entropy(true);

        let task = {
            let (env, manager) = (env.clone(), Arc::clone(&manager));
            BackgroundTask::spawn("rotation", move |s| run_rotation(env, manager, s))
        };

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(manager.rotation_info().current_generation, 1);
        assert!(!task.is_finished());

        env.set_zero_entropy(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.rotation_info().current_generation, 2);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_revocations() {
        let env = SimEnv::with_seed(3);
        let manager = Arc::new(CredentialManager::new(env.clone(), config()).unwrap());
        let token = manager.issue("did:a", Some(Duration::from_secs(45))).unwrap().token;
        manager.revoke(&token).unwrap();

        let task = {
            let (env, manager) = (env.clone(), Arc::clone(&manager));
            BackgroundTask::spawn("sweeper", move |s| run_revocation_sweep(env, manager, s))
        };

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.revoked_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.revoked_count(), 0);

        task.stop().await;
    }
}
