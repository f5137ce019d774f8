//! ResultStore port - the shared, externally visible home of job records.
//!
//! The store is the only shared mutable resource. Every mutation is one of
//! the atomic operations below; implementations must make each of them a
//! single compare-and-swap / transaction against the stored record.
//!
//! キューの通知は候補でしかない。正本はストアにあり、通知が失われても
//! `reap` が取りこぼした record を拾い直す。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    ClaimConflict, DeliveryError, JobId, JobRecord, JobResult, TransitionError, WorkerId,
};
use crate::observability::StateCounts;

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the record (returned as claimed).
    Claimed(JobRecord),
    /// Somebody else got there first, or there is nothing to do.
    Conflict(ClaimConflict),
}

/// Result of one attempt, applied by the owning worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Succeeded(JobResult),
    Retrying {
        next_attempt_at: DateTime<Utc>,
        error: DeliveryError,
    },
    Failed(DeliveryError),
}

/// Records after a successful `complete`.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub record: JobRecord,
    /// The parent batch, when this completion settled one of its dependents.
    pub parent: Option<JobRecord>,
}

/// Thresholds for `reap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// How long a delivery claim may stay `InProgress`. Must exceed the
    /// delivery timeout.
    pub lease: Duration,
    /// How long a claimable record may sit unclaimed before it is announced
    /// again.
    pub announce_after: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(120),
            announce_after: Duration::from_secs(30),
        }
    }
}

/// What one `reap` pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reaped {
    /// Records that need a fresh notice on the queue.
    pub announce: Vec<JobId>,
    /// Claims taken back after their lease ran out.
    pub expired: Vec<JobId>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("result store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a new record; fails if the id is taken.
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Insert a batch together with all its dependents, all or nothing.
    async fn insert_batch(
        &self,
        batch: JobRecord,
        dependents: Vec<JobRecord>,
    ) -> Result<(), StoreError>;

    /// `None` when the id was never stored or has been purged.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Atomic `Pending | Retrying(due) -> InProgress`.
    async fn claim(
        &self,
        id: JobId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Atomic `InProgress(worker) -> Succeeded | Retrying | Failed`.
    ///
    /// When the record is a batch dependent and becomes terminal, the parent's
    /// progress is updated in the same step, and the parent is finalized once
    /// every dependent has settled.
    async fn complete(
        &self,
        id: JobId,
        worker: WorkerId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Completed, StoreError>;

    /// Recover records that no notice or owner is going to move forward.
    ///
    /// Delivery claims older than `policy.lease` are expired (`Retrying`, or
    /// `Failed` when attempts are used up, settling the parent like
    /// `complete`). Claimable records left unclaimed for
    /// `policy.announce_after` are returned for re-announcement and stamped
    /// so they are not returned again before another `announce_after`.
    async fn reap(&self, now: DateTime<Utc>, policy: ReapPolicy) -> Result<Reaped, StoreError>;

    /// Drop terminal records whose retention has expired. Returns how many.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn counts(&self) -> Result<StateCounts, StoreError>;
}
