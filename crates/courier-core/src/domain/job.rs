//! Job record: the unit of work and its lifecycle.
//!
//! # 状態遷移はすべて record のメソッド経由
//! claim / succeed / schedule_retry / fail / expire_lease は現在の状態を
//! 確認してから書き換える。
//!
//! Design: the record is the single source of truth for a job. All state
//! transitions go through methods that check the current state first, so a
//! store implementation only has to run them under its own atomicity
//! (a lock, a CAS loop, a transaction) to keep the invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DeliveryError;
use super::ids::{JobId, WorkerId};
use super::state::{
    BatchProgress, ClaimConflict, JobResult, JobState, RecipientFailure, TransitionError,
};

/// Template rendering context.
pub type Context = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SingleDelivery,
    BatchDelivery,
}

/// Batch recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    pub fn named(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }
}

/// Where the template source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TemplateRef {
    /// A template registered with the renderer by name.
    Named(String),
    /// Template source carried in the payload itself.
    Inline(String),
}

impl TemplateRef {
    pub fn named(name: impl Into<String>) -> Self {
        TemplateRef::Named(name.into())
    }

    pub fn inline(source: impl Into<String>) -> Self {
        TemplateRef::Inline(source.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinglePayload {
    pub to: String,
    pub subject: String,
    pub template: TemplateRef,
    /// Optional plain-text alternative body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_template: Option<TemplateRef>,
    #[serde(default)]
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub recipients: Vec<Recipient>,
    pub subject: String,
    pub template: TemplateRef,
    #[serde(default)]
    pub shared_context: Context,
}

/// Immutable input of a job. The serde tag doubles as the job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    SingleDelivery(SinglePayload),
    BatchDelivery(BatchPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::SingleDelivery(_) => JobKind::SingleDelivery,
            JobPayload::BatchDelivery(_) => JobKind::BatchDelivery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,

    /// Batch this job was fanned out from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<JobId>,

    /// Jobs fanned out from this batch, in recipient order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<JobId>,

    /// Claims so far, including the current one while `InProgress`.
    pub attempt_count: u32,
    pub max_attempts: u32,

    pub state: JobState,

    /// A pending record is not claimable before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Last time the record was announced again after sitting unclaimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_at: Option<DateTime<Utc>>,

    /// Present only for batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<BatchProgress>,

    /// Error of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<DeliveryError>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set once terminal; the store drops the record after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn single(id: JobId, payload: SinglePayload, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self::new(id, JobPayload::SingleDelivery(payload), None, max_attempts, now)
    }

    /// A single delivery fanned out from `parent`.
    pub fn dependent(
        id: JobId,
        parent: JobId,
        payload: SinglePayload,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            id,
            JobPayload::SingleDelivery(payload),
            Some(parent),
            max_attempts,
            now,
        )
    }

    /// A batch runs one orchestration pass, hence a single attempt.
    pub fn batch(id: JobId, payload: BatchPayload, now: DateTime<Utc>) -> Self {
        let total = payload.recipients.len();
        let mut record = Self::new(id, JobPayload::BatchDelivery(payload), None, 1, now);
        record.progress = Some(BatchProgress::new(total));
        record
    }

    fn new(
        id: JobId,
        payload: JobPayload,
        parent: Option<JobId>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload,
            parent,
            dependents: Vec::new(),
            attempt_count: 0,
            max_attempts,
            state: JobState::Pending,
            not_before: None,
            announced_at: None,
            progress: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    /// Hold a pending record back until `at` (staggered batch admission).
    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Pending/Retrying(due) -> InProgress, counting one more attempt.
    pub fn claim(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Result<(), ClaimConflict> {
        match &self.state {
            JobState::Pending => {
                if let Some(at) = self.not_before.filter(|at| *at > now) {
                    return Err(ClaimConflict::NotYetDue(at));
                }
            }
            JobState::Retrying { next_attempt_at } if *next_attempt_at <= now => {}
            JobState::Retrying { next_attempt_at } => {
                return Err(ClaimConflict::NotYetDue(*next_attempt_at));
            }
            JobState::InProgress { owner, .. } => return Err(ClaimConflict::AlreadyClaimed(*owner)),
            JobState::Succeeded { .. } | JobState::Failed { .. } => {
                return Err(ClaimConflict::Terminal);
            }
        }
        if self.attempt_count >= self.max_attempts {
            // Unreachable through the public transitions; refuse rather than overrun.
            return Err(ClaimConflict::Terminal);
        }

        self.attempt_count += 1;
        self.state = JobState::InProgress {
            owner: worker,
            claimed_at: now,
        };
        self.updated_at = now;
        Ok(())
    }

    pub fn succeed(
        &mut self,
        worker: WorkerId,
        result: JobResult,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_owned_by(worker)?;
        self.state = JobState::Succeeded { result };
        self.updated_at = now;
        Ok(())
    }

    pub fn schedule_retry(
        &mut self,
        worker: WorkerId,
        next_attempt_at: DateTime<Utc>,
        error: DeliveryError,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_owned_by(worker)?;
        if self.attempt_count >= self.max_attempts {
            return Err(TransitionError::AttemptsExhausted {
                job_id: self.id,
                max_attempts: self.max_attempts,
            });
        }
        self.state = JobState::Retrying { next_attempt_at };
        self.last_error = Some(error);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(
        &mut self,
        worker: WorkerId,
        error: DeliveryError,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_owned_by(worker)?;
        self.last_error = Some(error.root().clone());
        self.state = JobState::Failed { error };
        self.updated_at = now;
        Ok(())
    }

    /// Fold one terminal dependent into this batch's progress.
    ///
    /// Finalizes the batch when the last dependent settles: `Succeeded` with
    /// the failures listed, or `Failed` when every dependent failed. Returns
    /// whether this call finalized the batch.
    pub fn settle_dependent(
        &mut self,
        recipient: &str,
        outcome: Result<(), DeliveryError>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        let JobState::InProgress { .. } = self.state else {
            return Err(TransitionError::NotInProgress {
                job_id: self.id,
                state: self.state.name(),
            });
        };
        let progress = self
            .progress
            .as_mut()
            .ok_or(TransitionError::NotBatch(self.id))?;

        progress.completed += 1;
        if let Err(error) = outcome {
            progress.failures.push(RecipientFailure {
                recipient: recipient.to_string(),
                error,
            });
        }
        self.updated_at = now;

        if progress.is_complete() {
            self.finalize_batch(now);
            return Ok(true);
        }
        Ok(false)
    }

    /// Close a batch whose progress is complete (also used for empty batches).
    pub fn finalize_batch(&mut self, now: DateTime<Utc>) {
        let Some(progress) = &self.progress else {
            return;
        };
        self.state = if progress.total > 0 && progress.failures.len() == progress.total {
            JobState::Failed {
                error: DeliveryError::BatchFailed {
                    total: progress.total,
                },
            }
        } else {
            JobState::Succeeded {
                result: JobResult::Batch(progress.summary()),
            }
        };
        self.updated_at = now;
    }

    /// When a record waiting for a claim became claimable.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Pending => Some(self.not_before.unwrap_or(self.created_at)),
            JobState::Retrying { next_attempt_at } => Some(*next_attempt_at),
            _ => None,
        }
    }

    /// Claimable for at least `grace`, counted from the later of the due time
    /// and the last re-announcement. Batches are never queued, so never stale.
    pub fn is_stale(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        if self.kind() == JobKind::BatchDelivery {
            return false;
        }
        let Some(due) = self.due_at() else {
            return false;
        };
        let since = self.announced_at.map_or(due, |at| at.max(due));
        since
            .checked_add_signed(grace)
            .is_some_and(|deadline| deadline <= now)
    }

    /// A delivery claim held for at least `lease`. Batch claims belong to the
    /// orchestrator for the batch's whole life and never expire.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        match &self.state {
            JobState::InProgress { claimed_at, .. } if self.kind() == JobKind::SingleDelivery => {
                claimed_at
                    .checked_add_signed(lease)
                    .is_some_and(|deadline| deadline <= now)
            }
            _ => false,
        }
    }

    /// Take back an abandoned claim. The unfinished attempt still counts:
    /// `Retrying` (due now) while attempts remain, otherwise `Failed`.
    pub fn expire_lease(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let JobState::InProgress { .. } = self.state else {
            return Err(TransitionError::NotInProgress {
                job_id: self.id,
                state: self.state.name(),
            });
        };
        let error = DeliveryError::transient("claim lease expired before the attempt completed");
        self.state = if self.attempt_count < self.max_attempts {
            JobState::Retrying {
                next_attempt_at: now,
            }
        } else {
            JobState::Failed {
                error: DeliveryError::RetryExhausted {
                    attempts: self.attempt_count,
                    last: Box::new(error.clone()),
                },
            }
        };
        self.last_error = Some(error);
        self.updated_at = now;
        Ok(())
    }

    fn ensure_owned_by(&self, worker: WorkerId) -> Result<(), TransitionError> {
        match &self.state {
            JobState::InProgress { owner, .. } if *owner == worker => Ok(()),
            JobState::InProgress { owner, .. } => Err(TransitionError::NotOwner {
                job_id: self.id,
                owner: *owner,
                caller: worker,
            }),
            other => Err(TransitionError::NotInProgress {
                job_id: self.id,
                state: other.name(),
            }),
        }
    }
}
