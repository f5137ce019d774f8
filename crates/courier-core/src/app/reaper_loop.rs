//! ReaperLoop - 取りこぼした record の回収と再通知
//!
//! # フロー
//! 1. `ResultStore::reap()` で lease 切れの claim を回収し、
//!    放置された Pending / Retrying を集める
//! 2. 集めた job を `DeliveryQueue::push()` で再通知する
//!
//! The queue only carries hints; a lost push, a failed `complete` or a dead
//! worker leaves the record to this loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::observability::millis;
use crate::ports::{Clock, DeliveryQueue, JobNotice, ReapPolicy, Reaped, ResultStore, StoreError};

pub struct ReaperLoop {
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn DeliveryQueue>,
    clock: Arc<dyn Clock>,
    policy: ReapPolicy,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn DeliveryQueue>,
        clock: Arc<dyn Clock>,
        policy: ReapPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            policy,
            interval,
        }
    }

    /// One pass: reap, then push a notice for every record that needs one.
    ///
    /// A push that fails here is picked up again by a later pass.
    pub async fn reap_once(&self) -> Result<Reaped, StoreError> {
        let reaped = self.store.reap(self.clock.now(), self.policy).await?;
        for job_id in &reaped.expired {
            warn!(job_id = %job_id, "claim lease expired");
        }
        for job_id in &reaped.announce {
            if let Err(err) = self.queue.push(JobNotice { job_id: *job_id }, Duration::ZERO).await {
                warn!(job_id = %job_id, %err, "re-announce failed");
            }
        }
        Ok(reaped)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = millis(self.interval), "reaper loop started");

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
                _ = ticker.tick() => match self.reap_once().await {
                    Ok(reaped) if !reaped.announce.is_empty() => {
                        info!(announced = reaped.announce.len(), expired = reaped.expired.len(), "reaper pass");
                    }
                    Ok(_) => {}
                    Err(err) => error!(%err, "reaper pass failed"),
                },
            }
        }
        info!("reaper loop stopped");
    }
}
