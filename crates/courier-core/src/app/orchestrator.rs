//! BatchOrchestrator - fans a batch out into independent single deliveries.
//!
//! The batch record, claimed by the orchestrator, and all of its dependents
//! are stored in one step; only then are dependents announced on the queue
//! with a staggered delay. From there on the batch is advanced by the store
//! as each dependent settles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::domain::{
    BatchPayload, Context, JobId, JobRecord, Recipient, SinglePayload, StaggerPolicy, TemplateRef,
    WorkerId,
};
use crate::error::CourierError;
use crate::ports::{Clock, DeliveryQueue, IdGenerator, JobNotice, ResultStore, StoreError};

/// Name used in a recipient's context when none was given.
const DEFAULT_RECIPIENT_NAME: &str = "User";

pub struct BatchOrchestrator {
    id: WorkerId,
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn DeliveryQueue>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    stagger: StaggerPolicy,
    dependent_max_attempts: u32,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn DeliveryQueue>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        stagger: StaggerPolicy,
        dependent_max_attempts: u32,
    ) -> Self {
        Self {
            id: ids.worker_id(),
            store,
            queue,
            clock,
            ids,
            stagger,
            dependent_max_attempts,
        }
    }

    /// Store the batch and its dependents, then announce the dependents.
    ///
    /// The batch is stored already claimed by this orchestrator (or already
    /// finalized when there are no recipients), in the same write as its
    /// dependents. Once that write succeeds the batch is accepted: a notice
    /// that fails to push is re-announced by the reaper, and each dependent
    /// carries its admission time so a re-announcement cannot jump the
    /// stagger.
    #[instrument(skip_all, fields(recipients = recipients.len()))]
    pub async fn submit_batch(
        &self,
        recipients: Vec<Recipient>,
        subject: String,
        template: TemplateRef,
        shared_context: Context,
    ) -> Result<JobId, CourierError> {
        CourierError::require("subject", &subject)?;
        for recipient in &recipients {
            CourierError::require("recipient email", &recipient.email)?;
        }

        let now = self.clock.now();
        let batch_id = self.ids.job_id();
        let mut notices = Vec::with_capacity(recipients.len());
        let dependents: Vec<JobRecord> = recipients
            .iter()
            .enumerate()
            .map(|(index, recipient)| {
                let delay = self.stagger.delay_for(index);
                let payload = SinglePayload {
                    to: recipient.email.clone(),
                    subject: subject.clone(),
                    template: template.clone(),
                    text_template: None,
                    context: recipient_context(recipient, &shared_context),
                };
                let record = JobRecord::dependent(
                    self.ids.job_id(),
                    batch_id,
                    payload,
                    self.dependent_max_attempts,
                    now,
                )
                .with_not_before(after(now, delay));
                notices.push((record.id, delay));
                record
            })
            .collect();

        let mut batch = JobRecord::batch(
            batch_id,
            BatchPayload {
                recipients,
                subject,
                template,
                shared_context,
            },
            now,
        );
        batch.dependents = dependents.iter().map(|d| d.id).collect();
        if let Err(conflict) = batch.claim(self.id, now) {
            return Err(StoreError::Unavailable(format!(
                "batch {batch_id} could not be claimed: {conflict:?}"
            ))
            .into());
        }
        if dependents.is_empty() {
            batch.finalize_batch(now);
        }

        self.store.insert_batch(batch, dependents).await?;
        if notices.is_empty() {
            info!(job_id = %batch_id, "empty batch completed");
            return Ok(batch_id);
        }

        let mut unannounced = 0;
        for (job_id, delay) in &notices {
            if let Err(err) = self.queue.push(JobNotice { job_id: *job_id }, *delay).await {
                warn!(job_id = %job_id, %err, "dependent notice not queued; left to the reaper");
                unannounced += 1;
            }
        }
        info!(job_id = %batch_id, total = notices.len(), unannounced, "batch fanned out");
        Ok(batch_id)
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

/// `{name, email}` for the recipient, then the shared context on top.
fn recipient_context(recipient: &Recipient, shared: &Context) -> Context {
    let mut context = Context::new();
    let name = recipient
        .name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(DEFAULT_RECIPIENT_NAME);
    context.insert("name".to_string(), Value::String(name.to_string()));
    context.insert("email".to_string(), Value::String(recipient.email.clone()));
    context.extend(shared.iter().map(|(k, v)| (k.clone(), v.clone())));
    context
}
