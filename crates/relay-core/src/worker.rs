//! Cancellable periodic background tasks

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Handle to a running periodic task
pub struct WorkerHandle {
    name: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the task and wait for it to exit.
    ///
    /// A pass that is already running completes first; no new pass starts.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
        info!(worker = self.name, "Worker stopped");
    }
}

/// Run `work` every `period` until stopped. The first pass happens one
/// period after spawning.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut work: F) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately; skip that one
        ticker.tick().await;

        info!(worker = name, period_secs = period.as_secs_f64(), "Worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!(worker = name, "Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    work().await;
                }
            }
        }
    });

    WorkerHandle {
        name,
        shutdown_tx,
        handle,
    }
}
