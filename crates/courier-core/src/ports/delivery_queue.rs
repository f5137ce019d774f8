//! DeliveryQueue port - the broker between producers and workers.
//!
//! The queue carries job ids only; state and payload live in the result
//! store. Delivery is at-least-once: the same notice may arrive more than
//! once, and workers rely on the store's atomic claim to turn duplicates into
//! no-ops.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::JobId;

/// "Job `job_id` may be ready" - a hint, never an authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobNotice {
    pub job_id: JobId,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,

    #[error("queue operation failed: {0}")]
    OperationFailed(String),
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Make `notice` visible to workers after `delay`.
    async fn push(&self, notice: JobNotice, delay: Duration) -> Result<(), QueueError>;

    /// Wait up to `timeout` for a visible notice.
    async fn pop(&self, timeout: Duration) -> Result<Option<JobNotice>, QueueError>;
}
