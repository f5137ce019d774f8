use thiserror::Error;

use crate::domain::JobId;
use crate::ports::{QueueError, StoreError};

/// Errors surfaced by the enqueue and status API.
///
/// Delivery failures never show up here; they are recorded on the job.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl CourierError {
    /// Reject an empty (or whitespace only) required field.
    pub(crate) fn require(field: &str, value: &str) -> Result<(), CourierError> {
        if value.trim().is_empty() {
            return Err(CourierError::Validation(format!("{field} must not be empty")));
        }
        Ok(())
    }
}
