//! Transport port - the outbound delivery channel (SMTP, HTTP mail API, ...).
//!
//! Connection and authentication details belong to the adapter. The adapter
//! is also the only place that knows whether a failure is transient or
//! permanent, so it returns an already classified `TransportError`.

use async_trait::async_trait;

use crate::domain::{Envelope, TransportError};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message. May block on network I/O; the caller bounds it
    /// with a timeout and treats expiry as a transient failure.
    async fn deliver(&self, envelope: &Envelope) -> Result<(), TransportError>;
}
