//! Periodic sweep of expired records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::AdmissionService;

/// Background task running [`AdmissionService::cleanup`] on an interval.
///
/// Sweeps run off the request path; a failed sweep is logged and the next
/// tick tries again.
pub struct CleanupWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupWorker {
    /// Start sweeping every `interval`. The first sweep runs one interval
    /// after spawning.
    pub fn spawn(service: Arc<AdmissionService>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                service = %service.id(),
                interval_ms = interval.as_millis() as u64,
                "Cleanup worker started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match service.cleanup().await {
                            Ok(removed) => debug!(removed, "Cleanup sweep finished"),
                            Err(e) => {
                                warn!(service = %service.id(), error = %e, "Cleanup sweep failed")
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(service = %service.id(), "Cleanup worker stopped");
        });

        Self { shutdown_tx, handle }
    }

    /// Signal the worker to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Cleanup worker panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
