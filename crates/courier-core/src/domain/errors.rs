//! Delivery-path error taxonomy.
//!
//! These errors never reach the producer as a `Result::Err`: they are
//! captured into the job record (`Retrying` / `Failed` / batch failures) and
//! read back through the status query.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by a transport adapter, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network hiccup, throttling, timeout: worth another attempt.
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid recipient, rejected message: retrying cannot help.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Rendering failure: missing template, syntax error, or undefined context key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TemplateError(pub String);

impl TemplateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error recorded on a job record.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("transient delivery error: {message}")]
    Transient { message: String },

    #[error("permanent delivery error: {message}")]
    Permanent { message: String },

    #[error("template error: {message}")]
    Template { message: String },

    /// Attempts reached the ceiling; `last` is the error of the final attempt.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<DeliveryError>,
    },

    /// Every dependent of a batch failed.
    #[error("all {total} deliveries in batch failed")]
    BatchFailed { total: usize },
}

impl DeliveryError {
    pub fn transient(message: impl Into<String>) -> Self {
        DeliveryError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        DeliveryError::Permanent {
            message: message.into(),
        }
    }

    /// Only transport hiccups are worth waiting for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }

    /// The error that actually happened, looking through `RetryExhausted`.
    pub fn root(&self) -> &DeliveryError {
        match self {
            DeliveryError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Transient(message) => DeliveryError::Transient { message },
            TransportError::Permanent(message) => DeliveryError::Permanent { message },
        }
    }
}

impl From<TemplateError> for DeliveryError {
    fn from(err: TemplateError) -> Self {
        DeliveryError::Template { message: err.0 }
    }
}
