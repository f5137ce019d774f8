//! ScriptedTransport - deterministic transport for tests and demos.
//!
//! Outcomes are scripted per recipient address. Scripted outcomes are
//! consumed in order; once a recipient's script runs out, deliveries to it
//! succeed, unless a sticky failure was set with `always_fail`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{Envelope, TransportError};
use crate::ports::Transport;

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Result<(), TransportError>>>,
    sticky: HashMap<String, TransportError>,
    attempts: HashMap<String, u32>,
    delivered: Vec<Envelope>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivery sleeps this long first.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue outcomes for the next deliveries to `to`.
    pub fn push_outcomes(
        &self,
        to: impl Into<String>,
        outcomes: impl IntoIterator<Item = Result<(), TransportError>>,
    ) {
        self.lock()
            .queued
            .entry(to.into())
            .or_default()
            .extend(outcomes);
    }

    /// Fail every delivery to `to` with `error`.
    pub fn always_fail(&self, to: impl Into<String>, error: TransportError) {
        self.lock().sticky.insert(to.into(), error);
    }

    /// Number of `deliver` calls made for `to`, successful or not.
    pub fn attempts(&self, to: &str) -> u32 {
        self.lock().attempts.get(to).copied().unwrap_or(0)
    }

    /// Envelopes that were delivered successfully, in delivery order.
    pub fn delivered(&self) -> Vec<Envelope> {
        self.lock().delivered.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut script = self.lock();
        *script.attempts.entry(envelope.to.clone()).or_default() += 1;

        let outcome = match script.sticky.get(&envelope.to) {
            Some(error) => Err(error.clone()),
            None => script
                .queued
                .get_mut(&envelope.to)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(())),
        };

        match &outcome {
            Ok(()) => script.delivered.push(envelope.clone()),
            Err(error) => debug!(to = %envelope.to, %error, "scripted delivery failure"),
        }
        outcome
    }
}
