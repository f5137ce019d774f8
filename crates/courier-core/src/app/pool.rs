use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::gc_loop::GcLoop;
use super::reaper_loop::ReaperLoop;
use super::worker::DeliveryWorker;

/// Handle to a set of running workers plus their background loops.
/// - `request_shutdown()` stops them from taking new notices
/// - `shutdown_and_join()` also waits for in-flight deliveries to finish
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: impl IntoIterator<Item = DeliveryWorker>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins: Vec<_> = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(shutdown_rx.clone())))
            .collect();
        info!(workers = joins.len(), "worker pool started");

        Self { shutdown_tx, joins }
    }

    /// Run `reaper` under the same shutdown signal as the workers.
    pub fn with_reaper(mut self, reaper: ReaperLoop) -> Self {
        let rx = self.shutdown_tx.subscribe();
        self.joins.push(tokio::spawn(reaper.run(rx)));
        self
    }

    /// Run `gc` under the same shutdown signal as the workers.
    pub fn with_gc(mut self, gc: GcLoop) -> Self {
        let rx = self.shutdown_tx.subscribe();
        self.joins.push(tokio::spawn(gc.run(rx)));
        self
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(%err, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}
