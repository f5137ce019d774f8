//! Decision model: what to do after a failed attempt.
//!
//! Deciders are pure functions: attempt count + failure in, next action out.
//! Applying the decision (updating the record, re-queueing) is the worker's
//! job.

use std::time::Duration;

use super::errors::DeliveryError;
use super::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Try again after `delay`.
    Retry { delay: Duration },

    /// Give up; `error` becomes the record's final error.
    Abandon { error: DeliveryError },
}

pub trait Decider: Send + Sync {
    /// `attempt_count` includes the attempt that just failed.
    fn decide(&self, attempt_count: u32, max_attempts: u32, failure: &DeliveryError) -> Decision;
}

impl Decider for RetryPolicy {
    fn decide(&self, attempt_count: u32, max_attempts: u32, failure: &DeliveryError) -> Decision {
        if !failure.is_retryable() {
            return Decision::Abandon {
                error: failure.clone(),
            };
        }
        if attempt_count >= max_attempts {
            return Decision::Abandon {
                error: DeliveryError::RetryExhausted {
                    attempts: attempt_count,
                    last: Box::new(failure.clone()),
                },
            };
        }
        Decision::Retry {
            delay: self.next_delay(attempt_count),
        }
    }
}
