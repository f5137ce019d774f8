//! Domain model: ids, job records, lifecycle state, errors, policies.

pub mod admission;
pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod job;
pub mod retry;
pub mod state;

pub use admission::StaggerPolicy;
pub use decision::{Decider, Decision};
pub use envelope::Envelope;
pub use errors::{DeliveryError, TemplateError, TransportError};
pub use ids::{JobId, WorkerId};
pub use job::{
    BatchPayload, Context, JobKind, JobPayload, JobRecord, Recipient, SinglePayload, TemplateRef,
};
pub use retry::{RetryPolicies, RetryPolicy};
pub use state::{
    BatchProgress, BatchSummary, ClaimConflict, DeliveryReceipt, JobResult, JobState,
    RecipientFailure, TransitionError,
};
