//! Lifecycle state of a job record.
//!
//! State transitions:
//! - Pending -> InProgress -> Succeeded
//! - Pending -> InProgress -> Retrying -> InProgress (once `next_attempt_at` has passed)
//! - Pending -> InProgress -> Failed
//! - InProgress -> Retrying | Failed when the claim's lease expires
//!
//! Nothing ever returns to `Pending`, and `Succeeded` / `Failed` are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::errors::DeliveryError;
use super::ids::{JobId, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Created by enqueue, not yet claimed.
    Pending,

    /// Owned by exactly one worker.
    InProgress {
        owner: WorkerId,
        claimed_at: DateTime<Utc>,
    },

    /// Waiting for backoff to elapse.
    Retrying { next_attempt_at: DateTime<Utc> },

    Succeeded { result: JobResult },

    Failed { error: DeliveryError },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded { .. } | JobState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InProgress { .. } => "in_progress",
            JobState::Retrying { .. } => "retrying",
            JobState::Succeeded { .. } => "succeeded",
            JobState::Failed { .. } => "failed",
        }
    }
}

/// Summary stored on a succeeded job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResult {
    Delivered(DeliveryReceipt),
    Batch(BatchSummary),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub to: String,
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

/// One failed dependent of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientFailure {
    pub recipient: String,
    pub error: DeliveryError,
}

/// Aggregate progress of a batch.
///
/// `completed` counts dependents that reached a terminal state, successful or
/// not. `total` is fixed when the batch is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub failures: Vec<RecipientFailure>,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            completed: 0,
            total,
            failures: Vec::new(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.total - self.completed
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.total,
            sent: self.completed - self.failures.len(),
            failed: self.failures.len(),
        }
    }
}

/// Why a claim did not happen. Benign: the losing claimant just does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimConflict {
    /// Another worker holds the record.
    AlreadyClaimed(WorkerId),
    /// Backoff has not elapsed yet.
    NotYetDue(DateTime<Utc>),
    /// Already succeeded or failed.
    Terminal,
    /// No such record (never enqueued, or purged after retention).
    Missing,
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {job_id} is {state}, expected in_progress")]
    NotInProgress { job_id: JobId, state: &'static str },

    #[error("job {job_id} is owned by {owner}, not {caller}")]
    NotOwner {
        job_id: JobId,
        owner: WorkerId,
        caller: WorkerId,
    },

    #[error("job {0} is not a batch")]
    NotBatch(JobId),

    #[error("attempt ceiling {max_attempts} reached for job {job_id}")]
    AttemptsExhausted { job_id: JobId, max_attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(
            !JobState::Retrying {
                next_attempt_at: Utc::now()
            }
            .is_terminal()
        );
        assert!(
            JobState::Failed {
                error: DeliveryError::permanent("x")
            }
            .is_terminal()
        );
    }

    #[test]
    fn summary_splits_sent_and_failed() {
        let mut progress = BatchProgress::new(3);
        progress.completed = 3;
        progress.failures.push(RecipientFailure {
            recipient: "b@example.com".into(),
            error: DeliveryError::permanent("bounced"),
        });

        assert_eq!(
            progress.summary(),
            BatchSummary {
                total: 3,
                sent: 2,
                failed: 1
            }
        );
        assert_eq!(progress.outstanding(), 0);
    }

    #[test]
    fn state_serializes_with_tag() {
        let v = serde_json::to_value(JobState::Pending).unwrap();
        assert_eq!(v["state"], "pending");
    }
}
