//! GcLoop - drops terminal records once their retention has passed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::observability::millis;
use crate::ports::{Clock, ResultStore, StoreError};

pub struct GcLoop {
    store: Arc<dyn ResultStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl GcLoop {
    pub fn new(store: Arc<dyn ResultStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval,
        }
    }

    /// One purge pass. Returns the number of records removed.
    pub async fn purge_once(&self) -> Result<usize, StoreError> {
        self.store.purge_expired(self.clock.now()).await
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = millis(self.interval), "gc loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => match self.purge_once().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "gc pass"),
                    Err(err) => error!(%err, "gc pass failed"),
                },
            }
        }
        info!("gc loop stopped");
    }
}
