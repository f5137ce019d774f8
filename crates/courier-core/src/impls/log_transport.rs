//! LogTransport - writes each envelope to the log instead of sending it.

use async_trait::async_trait;
use tracing::info;

use crate::domain::{Envelope, TransportError};
use crate::ports::Transport;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), TransportError> {
        info!(
            from = %envelope.from,
            to = %envelope.to,
            subject = %envelope.subject,
            html_bytes = envelope.html.len(),
            has_text = envelope.text.is_some(),
            "delivered (log only)"
        );
        Ok(())
    }
}
