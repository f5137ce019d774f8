//! DeliveryWorker - processes one single-delivery job per notice.
//!
//! # Flow
//! claim -> render -> deliver (bounded by a timeout) -> decide -> complete
//!
//! A lost claim is a no-op, which is what makes duplicate notices harmless.
//! The worker mutates only the record it claimed; batch aggregation happens
//! inside the store's `complete`.
//!
//! A notice that cannot be pushed, or a claim that is never completed, is
//! not lost: the reaper re-announces the record or takes the claim back once
//! its lease runs out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    ClaimConflict, Decider, Decision, DeliveryError, DeliveryReceipt, Envelope, JobId, JobPayload,
    JobRecord, JobResult, RetryPolicies, SinglePayload, WorkerId,
};
use crate::error::CourierError;
use crate::observability::millis;
use crate::ports::{
    ClaimOutcome, Clock, Completion, DeliveryQueue, JobNotice, Renderer, ResultStore, Transport,
};

/// How long an idle worker waits on the queue before checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a queue error before polling again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Delivery settings shared by every worker of a dispatcher.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub policies: RetryPolicies,
    pub delivery_timeout: Duration,
    pub from: String,
}

/// What one `process` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// Not ours to run: claimed elsewhere, already terminal, or gone.
    Skipped(ClaimConflict),
    /// Popped before its retry or admission time; the notice was pushed back.
    Deferred { remaining: Duration },
    Succeeded,
    Retrying { delay: Duration },
    Failed(DeliveryError),
}

pub struct DeliveryWorker {
    id: WorkerId,
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn DeliveryQueue>,
    renderer: Arc<dyn Renderer>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    settings: Arc<DeliverySettings>,
}

impl DeliveryWorker {
    pub fn new(
        id: WorkerId,
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn DeliveryQueue>,
        renderer: Arc<dyn Renderer>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        settings: Arc<DeliverySettings>,
    ) -> Self {
        Self {
            id,
            store,
            queue,
            renderer,
            transport,
            clock,
            settings,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run one attempt of `job_id`, if this worker wins the claim.
    ///
    /// Delivery failures are recorded on the job and reported as
    /// `Processed`; `Err` means the store or queue itself failed.
    #[instrument(skip_all, fields(worker_id = %self.id, job_id = %job_id))]
    pub async fn process(&self, job_id: JobId) -> Result<Processed, CourierError> {
        let now = self.clock.now();
        let record = match self.store.claim(job_id, self.id, now).await? {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::Conflict(ClaimConflict::NotYetDue(due)) => {
                let remaining = (due - now).to_std().unwrap_or(Duration::ZERO);
                match self.queue.push(JobNotice { job_id }, remaining).await {
                    Ok(()) => debug!(delay_ms = millis(remaining), "not due yet, deferred"),
                    Err(err) => warn!(%err, "deferred notice not queued; left to the reaper"),
                }
                return Ok(Processed::Deferred { remaining });
            }
            ClaimOutcome::Conflict(conflict) => {
                debug!(?conflict, "claim lost, skipping");
                return Ok(Processed::Skipped(conflict));
            }
        };

        let JobPayload::SingleDelivery(payload) = &record.payload else {
            // Batches are driven by their orchestrator and never queued.
            warn!("batch record reached a delivery worker");
            let error = DeliveryError::permanent("batch records are not deliverable");
            self.store
                .complete(job_id, self.id, Completion::Failed(error.clone()), self.clock.now())
                .await?;
            return Ok(Processed::Failed(error));
        };

        let attempt = record.attempt_count;
        debug!(attempt, to = %payload.to, "claimed");

        match self.attempt(payload).await {
            Ok(receipt) => {
                self.store
                    .complete(
                        job_id,
                        self.id,
                        Completion::Succeeded(JobResult::Delivered(receipt)),
                        self.clock.now(),
                    )
                    .await?;
                info!(attempt, "delivered");
                Ok(Processed::Succeeded)
            }
            Err(failure) => self.settle_failure(&record, failure).await,
        }
    }

    async fn settle_failure(
        &self,
        record: &JobRecord,
        failure: DeliveryError,
    ) -> Result<Processed, CourierError> {
        let policy = self.settings.policies.for_delivery(record.parent.is_some());
        let attempt = record.attempt_count;
        let now = self.clock.now();

        match policy.decide(attempt, record.max_attempts, &failure) {
            Decision::Retry { delay } => {
                let next_attempt_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);
                self.store
                    .complete(
                        record.id,
                        self.id,
                        Completion::Retrying {
                            next_attempt_at,
                            error: failure.clone(),
                        },
                        now,
                    )
                    .await?;
                warn!(attempt, delay_ms = millis(delay), error = %failure, "attempt failed, retrying");
                if let Err(err) = self.queue.push(JobNotice { job_id: record.id }, delay).await {
                    warn!(%err, "retry notice not queued; left to the reaper");
                }
                Ok(Processed::Retrying { delay })
            }
            Decision::Abandon { error } => {
                self.store
                    .complete(record.id, self.id, Completion::Failed(error.clone()), now)
                    .await?;
                error!(attempt, %error, "delivery failed");
                Ok(Processed::Failed(error))
            }
        }
    }

    async fn attempt(&self, payload: &SinglePayload) -> Result<DeliveryReceipt, DeliveryError> {
        let html = self.renderer.render(&payload.template, &payload.context)?;
        let text = payload
            .text_template
            .as_ref()
            .map(|template| self.renderer.render_text(template, &payload.context))
            .transpose()?;

        let envelope = Envelope {
            from: self.settings.from.clone(),
            to: payload.to.clone(),
            subject: payload.subject.clone(),
            html,
            text,
        };

        let timeout = self.settings.delivery_timeout;
        match tokio::time::timeout(timeout, self.transport.deliver(&envelope)).await {
            Ok(Ok(())) => Ok(DeliveryReceipt {
                to: envelope.to,
                subject: envelope.subject,
                message: "delivered".to_string(),
            }),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(DeliveryError::transient(format!(
                "delivery timed out after {}ms",
                millis(timeout)
            ))),
        }
    }

    /// Pull notices until shutdown is signalled.
    ///
    /// Shutdown stops the worker from taking new notices; a delivery in
    /// flight runs to completion first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let popped = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                popped = self.queue.pop(POLL_INTERVAL) => popped,
            };

            let notice = match popped {
                Ok(Some(notice)) => notice,
                Ok(None) => continue,
                Err(err) => {
                    error!(worker_id = %self.id, %err, "queue pop failed");
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if let Err(err) = self.process(notice.job_id).await {
                error!(worker_id = %self.id, job_id = %notice.job_id, %err, "processing failed");
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Context, JobState, RetryPolicy, TemplateRef, TransportError};
    use crate::impls::{
        InMemoryDeliveryQueue, InMemoryResultStore, MiniJinjaRenderer, ScriptedTransport,
    };
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    struct Rig {
        store: Arc<InMemoryResultStore>,
        queue: Arc<InMemoryDeliveryQueue>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<FixedClock>,
        worker: DeliveryWorker,
    }

    fn rig_with(transport: ScriptedTransport, timeout: Duration) -> Rig {
        let store = Arc::new(InMemoryResultStore::default());
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let transport = Arc::new(transport);
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let settings = Arc::new(DeliverySettings {
            policies: RetryPolicies::uniform(RetryPolicy::default_v1().without_jitter()),
            delivery_timeout: timeout,
            from: "noreply@example.com".to_string(),
        });
        let worker = DeliveryWorker::new(
            WorkerId::from_ulid(Ulid::new()),
            store.clone(),
            queue.clone(),
            Arc::new(MiniJinjaRenderer::new()),
            transport.clone(),
            clock.clone(),
            settings,
        );
        Rig {
            store,
            queue,
            transport,
            clock,
            worker,
        }
    }

    fn rig() -> Rig {
        rig_with(ScriptedTransport::new(), Duration::from_secs(30))
    }

    async fn enqueue(rig: &Rig, template: &str) -> JobId {
        let id = JobId::from_ulid(Ulid::new());
        let mut context = Context::new();
        context.insert("name".into(), "Ada".into());
        let payload = SinglePayload {
            to: "ada@example.com".into(),
            subject: "Hello".into(),
            template: TemplateRef::inline(template),
            text_template: Some(TemplateRef::inline("Hi {{ name }}")),
            context,
        };
        rig.store
            .insert(JobRecord::single(id, payload, 3, rig.clock.now()))
            .await
            .unwrap();
        id
    }

    async fn state_of(rig: &Rig, id: JobId) -> JobRecord {
        rig.store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_records_a_receipt() {
        let rig = rig();
        let id = enqueue(&rig, "<p>Hi {{ name }}</p>").await;

        assert_eq!(rig.worker.process(id).await.unwrap(), Processed::Succeeded);

        let record = state_of(&rig, id).await;
        assert_eq!(record.attempt_count, 1);
        assert!(matches!(
            record.state,
            JobState::Succeeded { result: JobResult::Delivered(ref r) } if r.to == "ada@example.com"
        ));
        let sent = rig.transport.delivered();
        assert_eq!(sent[0].html, "<p>Hi Ada</p>");
        assert_eq!(sent[0].text.as_deref(), Some("Hi Ada"));
        assert_eq!(sent[0].from, "noreply@example.com");
    }

    #[tokio::test]
    async fn duplicate_notice_is_a_no_op() {
        let rig = rig();
        let id = enqueue(&rig, "<p>Hi</p>").await;

        rig.worker.process(id).await.unwrap();
        let second = rig.worker.process(id).await.unwrap();

        assert_eq!(second, Processed::Skipped(ClaimConflict::Terminal));
        assert_eq!(rig.transport.attempts("ada@example.com"), 1);
    }

    #[tokio::test]
    async fn template_error_fails_without_delivery() {
        let rig = rig();
        let id = enqueue(&rig, "<p>{{ missing }}</p>").await;

        let processed = rig.worker.process(id).await.unwrap();

        assert!(matches!(processed, Processed::Failed(DeliveryError::Template { .. })));
        assert_eq!(rig.transport.attempts("ada@example.com"), 0);
        assert!(state_of(&rig, id).await.is_terminal());
    }

    #[tokio::test]
    async fn permanent_error_skips_retry() {
        let rig = rig();
        rig.transport
            .always_fail("ada@example.com", TransportError::Permanent("mailbox unknown".into()));
        let id = enqueue(&rig, "<p>Hi</p>").await;

        let processed = rig.worker.process(id).await.unwrap();

        assert_eq!(processed, Processed::Failed(DeliveryError::permanent("mailbox unknown")));
        assert_eq!(state_of(&rig, id).await.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_schedules_a_retry_notice() {
        let rig = rig();
        rig.transport
            .push_outcomes("ada@example.com", [Err(TransportError::Transient("busy".into()))]);
        let id = enqueue(&rig, "<p>Hi</p>").await;

        let processed = rig.worker.process(id).await.unwrap();

        assert_eq!(processed, Processed::Retrying { delay: Duration::from_secs(2) });
        let record = state_of(&rig, id).await;
        assert!(matches!(record.state, JobState::Retrying { .. }));
        assert_eq!(record.last_error, Some(DeliveryError::transient("busy")));
        assert_eq!(rig.queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn early_notice_is_deferred_until_due() {
        let rig = rig();
        rig.transport
            .push_outcomes("ada@example.com", [Err(TransportError::Transient("busy".into()))]);
        let id = enqueue(&rig, "<p>Hi</p>").await;
        rig.worker.process(id).await.unwrap();

        rig.clock.advance(Duration::from_millis(500));
        let early = rig.worker.process(id).await.unwrap();
        assert_eq!(early, Processed::Deferred { remaining: Duration::from_millis(1500) });

        rig.clock.advance(Duration::from_millis(1500));
        assert_eq!(rig.worker.process(id).await.unwrap(), Processed::Succeeded);
        assert_eq!(state_of(&rig, id).await.attempt_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_timeout_is_transient() {
        let rig = rig_with(
            ScriptedTransport::new().with_latency(Duration::from_secs(10)),
            Duration::from_secs(1),
        );
        let id = enqueue(&rig, "<p>Hi</p>").await;

        let processed = rig.worker.process(id).await.unwrap();

        assert!(matches!(processed, Processed::Retrying { .. }));
        assert!(matches!(
            state_of(&rig, id).await.last_error,
            Some(DeliveryError::Transient { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_queue_and_stops_on_shutdown() {
        let rig = rig();
        let id = enqueue(&rig, "<p>Hi</p>").await;
        rig.queue.push(JobNotice { job_id: id }, Duration::ZERO).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let store = rig.store.clone();
        let handle = tokio::spawn(rig.worker.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(store.get(id).await.unwrap().unwrap().is_terminal());
    }
}
