use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_core::domain::{Context, JobId, Recipient, TemplateRef, TransportError};
use courier_core::impls::{
    InMemoryDeliveryQueue, InMemoryResultStore, MiniJinjaRenderer, ScriptedTransport,
};
use courier_core::{CourierConfig, Dispatcher, DispatcherBuilder};

const NEWSLETTER: &str = "<h1>{{ headline }}</h1><p>Hi {{ name }}, this issue went to {{ email }}.</p>";

#[tokio::main]
async fn main() -> Result<()> {
    // (A) .env and logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CourierConfig::from_env().context("reading COURIER_* configuration")?;
    info!(?config, "configuration loaded");

    // (B) wiring: in-memory store/queue, a transport that rejects one address
    let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(50)));
    transport.always_fail(
        "bounce@example.com",
        TransportError::Permanent("550 mailbox unavailable".into()),
    );
    transport.push_outcomes(
        "flaky@example.com",
        [Err(TransportError::Transient("421 try again later".into()))],
    );

    let dispatcher = DispatcherBuilder::from_config(&config)
        .store(Arc::new(InMemoryResultStore::new(config.result_ttl)))
        .queue(Arc::new(InMemoryDeliveryQueue::new()))
        .renderer(Arc::new(MiniJinjaRenderer::with_builtin_templates()?))
        .transport(transport.clone())
        .build()?;

    // (C) workers + retention purge
    let pool = dispatcher
        .spawn_workers(config.workers.max(1))
        .with_gc(dispatcher.gc_loop(config.gc_interval));

    // (D) enqueue
    let welcome = dispatcher.enqueue_welcome("ada@example.com", "Ada").await?;
    let reset = dispatcher
        .enqueue_password_reset("ada@example.com", "Ada", "demo-token")
        .await?;

    let mut shared = Context::new();
    shared.insert("headline".into(), "Release notes".into());
    let batch = dispatcher
        .enqueue_batch(
            vec![
                Recipient::named("grace@example.com", "Grace"),
                Recipient::new("bounce@example.com"),
                Recipient::named("flaky@example.com", "Flaky"),
                Recipient::named("linus@example.com", "Linus"),
            ],
            "Release notes",
            TemplateRef::inline(NEWSLETTER),
            shared,
        )
        .await?;

    // (E) poll until terminal, or until ctrl-c
    let ids = [welcome, reset, batch];
    tokio::select! {
        result = wait_for_all(&dispatcher, &ids) => result?,
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }

    for id in [welcome, reset, batch] {
        let record = dispatcher.get_status(id).await?;
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    let counts = dispatcher.counts().await?;
    info!(?counts, delivered = transport.delivered().len(), "done");

    pool.shutdown_and_join().await;
    Ok(())
}

async fn wait_for_all(dispatcher: &Dispatcher, ids: &[JobId]) -> Result<()> {
    loop {
        let mut pending = 0;
        for id in ids {
            let record = dispatcher.get_status(*id).await?;
            if !record.is_terminal() {
                pending += 1;
                if let Some(progress) = &record.progress {
                    info!(job_id = %id, completed = progress.completed, total = progress.total, "batch progress");
                }
            }
        }
        if pending == 0 {
            return Ok(());
        }
        sleep(Duration::from_millis(250)).await;
    }
}
