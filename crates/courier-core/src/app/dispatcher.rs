//! Dispatcher - the producer-facing surface: enqueue and status.
//!
//! Enqueue validates the request, stores a `Pending` record and announces
//! it on the queue. It never runs a delivery and never reports delivery
//! errors; those are read back through `get_status`. A job is accepted once
//! its record is stored: `Err` means nothing was stored, and a notice that
//! fails to push is re-announced by the reaper.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, instrument, warn};

use super::gc_loop::GcLoop;
use super::orchestrator::BatchOrchestrator;
use super::pool::WorkerPool;
use super::reaper_loop::ReaperLoop;
use super::worker::{DeliverySettings, DeliveryWorker};
use crate::domain::{Context, JobId, JobRecord, Recipient, SinglePayload, TemplateRef};
use crate::error::CourierError;
use crate::impls::minijinja_renderer::{PASSWORD_RESET, WELCOME};
use crate::observability::StateCounts;
use crate::ports::{
    Clock, DeliveryQueue, IdGenerator, JobNotice, ReapPolicy, Renderer, ResultStore, Transport,
};

pub struct Dispatcher {
    pub(super) store: Arc<dyn ResultStore>,
    pub(super) queue: Arc<dyn DeliveryQueue>,
    pub(super) renderer: Arc<dyn Renderer>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ids: Arc<dyn IdGenerator>,
    pub(super) settings: Arc<DeliverySettings>,
    pub(super) orchestrator: BatchOrchestrator,
    pub(super) reset_url: String,
    pub(super) reap: ReapPolicy,
    pub(super) reap_interval: Duration,
}

impl Dispatcher {
    pub async fn enqueue_single(
        &self,
        to: impl Into<String>,
        subject: impl Into<String>,
        template: TemplateRef,
        context: Context,
    ) -> Result<JobId, CourierError> {
        self.enqueue(SinglePayload {
            to: to.into(),
            subject: subject.into(),
            template,
            text_template: None,
            context,
        })
        .await
    }

    /// Enqueue a fully specified single delivery (e.g. with a text body).
    #[instrument(skip_all, fields(to = %payload.to))]
    pub async fn enqueue(&self, payload: SinglePayload) -> Result<JobId, CourierError> {
        CourierError::require("recipient email", &payload.to)?;
        CourierError::require("subject", &payload.subject)?;

        let id = self.ids.job_id();
        let max_attempts = self.settings.policies.single.max_attempts;
        self.store
            .insert(JobRecord::single(id, payload, max_attempts, self.clock.now()))
            .await?;
        match self.queue.push(JobNotice { job_id: id }, Duration::ZERO).await {
            Ok(()) => info!(job_id = %id, "single delivery enqueued"),
            Err(err) => warn!(job_id = %id, %err, "single delivery stored but not queued; left to the reaper"),
        }
        Ok(id)
    }

    pub async fn enqueue_batch(
        &self,
        recipients: Vec<Recipient>,
        subject: impl Into<String>,
        template: TemplateRef,
        shared_context: Context,
    ) -> Result<JobId, CourierError> {
        self.orchestrator
            .submit_batch(recipients, subject.into(), template, shared_context)
            .await
    }

    pub async fn enqueue_welcome(
        &self,
        email: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<JobId, CourierError> {
        let mut context = Context::new();
        context.insert("name".to_string(), Value::String(name.into()));
        self.enqueue_single(email, "Welcome aboard!", TemplateRef::named(WELCOME), context)
            .await
    }

    pub async fn enqueue_password_reset(
        &self,
        email: impl Into<String>,
        name: impl Into<String>,
        reset_token: &str,
    ) -> Result<JobId, CourierError> {
        CourierError::require("reset token", reset_token)?;
        let mut context = Context::new();
        context.insert("name".to_string(), Value::String(name.into()));
        context.insert(
            "reset_link".to_string(),
            Value::String(format!("{}?token={reset_token}", self.reset_url)),
        );
        self.enqueue_single(
            email,
            "Reset your password",
            TemplateRef::named(PASSWORD_RESET),
            context,
        )
        .await
    }

    /// Current record for `id`; `NotFound` once it has been purged.
    pub async fn get_status(&self, id: JobId) -> Result<JobRecord, CourierError> {
        self.store.get(id).await?.ok_or(CourierError::NotFound(id))
    }

    pub async fn counts(&self) -> Result<StateCounts, CourierError> {
        Ok(self.store.counts().await?)
    }

    /// A worker bound to this dispatcher's store, queue and collaborators.
    pub fn worker(&self) -> DeliveryWorker {
        DeliveryWorker::new(
            self.ids.worker_id(),
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.renderer),
            Arc::clone(&self.transport),
            Arc::clone(&self.clock),
            Arc::clone(&self.settings),
        )
    }

    /// `n` workers plus the reaper that recovers what they leave behind.
    pub fn spawn_workers(&self, n: usize) -> WorkerPool {
        WorkerPool::spawn((0..n).map(|_| self.worker())).with_reaper(self.reaper_loop())
    }

    pub fn reaper_loop(&self) -> ReaperLoop {
        ReaperLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.clock),
            self.reap,
            self.reap_interval,
        )
    }

    pub fn gc_loop(&self, interval: Duration) -> GcLoop {
        GcLoop::new(Arc::clone(&self.store), Arc::clone(&self.clock), interval)
    }
}
