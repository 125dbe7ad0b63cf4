//! Supervised background tasks.
//!
//! Every long-running loop (liveness, rotation, revocation sweep) runs as a
//! [`BackgroundTask`]: a join handle plus a `watch` channel carrying the stop
//! request. Stopping signals the loop and awaits it, so the owner knows the
//! loop has exited before tearing down shared state.

use std::future::Future;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

/// Stop request observed by a running loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once a stop was requested or the owning task handle dropped.
    pub async fn cancelled(&mut self) {
        // wait_for errors only when the sender is gone, which also means stop
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// A spawned loop that can be asked to stop.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body` on the current runtime, handing it a [`ShutdownSignal`].
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, rx) = watch::channel(false);
        let handle = tokio::spawn(body(ShutdownSignal { rx }));
        debug!(task = name, "background task started");
        Self { name, stop, handle }
    }

    /// Task name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(()) => debug!(task = self.name, "background task stopped"),
            Err(e) => warn!(task = self.name, error = %e, "background task ended abnormally"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_sleeping_loop() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);

        let task = BackgroundTask::spawn("ticker", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(10)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!task.is_finished());
        task.stop().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn signal_resolves_on_stop_request() {
        let (tx, rx) = watch::channel(false);
        let mut signal = ShutdownSignal { rx };

        tx.send(true).unwrap();
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_cancelled() {
        let (tx, rx) = watch::channel(false);
        let mut signal = ShutdownSignal { rx };
        drop(tx);
        signal.cancelled().await;
    }
}
