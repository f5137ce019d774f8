//! DispatcherBuilder - wiring and fail-fast validation.
//!
//! The store, queue, renderer and transport must be supplied; the clock and
//! id generator fall back to the system clock and ULIDs. Every missing
//! component is reported at once by `build()`.
//!
//! lease は delivery timeout より長くなければならない。短いと、まだ配送中の
//! claim を reaper が奪ってしまう。

use std::sync::Arc;
use std::time::Duration;

use super::dispatcher::Dispatcher;
use super::orchestrator::BatchOrchestrator;
use super::worker::DeliverySettings;
use crate::config::CourierConfig;
use crate::domain::{RetryPolicies, StaggerPolicy};
use crate::ports::{
    Clock, DeliveryQueue, IdGenerator, ReapPolicy, Renderer, ResultStore, SystemClock, Transport,
    UlidGenerator,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing components: {0:?}")]
    MissingComponents(Vec<&'static str>),

    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("claim lease {lease:?} must exceed the delivery timeout {timeout:?}")]
    LeaseTooShort { lease: Duration, timeout: Duration },
}

pub struct DispatcherBuilder {
    store: Option<Arc<dyn ResultStore>>,
    queue: Option<Arc<dyn DeliveryQueue>>,
    renderer: Option<Arc<dyn Renderer>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    policies: RetryPolicies,
    stagger: StaggerPolicy,
    delivery_timeout: Duration,
    from: String,
    reset_url: String,
    reap: ReapPolicy,
    reap_interval: Duration,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::from_config(&CourierConfig::default())
    }

    /// Policies, timeouts and addresses from `config`; components still
    /// have to be supplied.
    pub fn from_config(config: &CourierConfig) -> Self {
        Self {
            store: None,
            queue: None,
            renderer: None,
            transport: None,
            clock: None,
            ids: None,
            policies: config.retry.clone(),
            stagger: config.stagger,
            delivery_timeout: config.delivery_timeout,
            from: config.from.clone(),
            reset_url: config.reset_url.clone(),
            reap: config.reap,
            reap_interval: config.reap_interval,
        }
    }

    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn retry_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn stagger(mut self, stagger: StaggerPolicy) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn from_address(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn reset_url(mut self, url: impl Into<String>) -> Self {
        self.reset_url = url.into();
        self
    }

    pub fn reap_policy(mut self, reap: ReapPolicy) -> Self {
        self.reap = reap;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn build(self) -> Result<Dispatcher, BuildError> {
        let mut missing = Vec::new();
        if self.store.is_none() {
            missing.push("store");
        }
        if self.queue.is_none() {
            missing.push("queue");
        }
        if self.renderer.is_none() {
            missing.push("renderer");
        }
        if self.transport.is_none() {
            missing.push("transport");
        }
        let (Some(store), Some(queue), Some(renderer), Some(transport)) =
            (self.store, self.queue, self.renderer, self.transport)
        else {
            return Err(BuildError::MissingComponents(missing));
        };
        if self.policies.single.max_attempts == 0 || self.policies.batch.max_attempts == 0 {
            return Err(BuildError::ZeroAttempts);
        }
        if self.reap.lease <= self.delivery_timeout {
            return Err(BuildError::LeaseTooShort {
                lease: self.reap.lease,
                timeout: self.delivery_timeout,
            });
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self.ids.unwrap_or_else(|| {
            Arc::new(UlidGenerator::new(Arc::clone(&clock))) as Arc<dyn IdGenerator>
        });

        let orchestrator = BatchOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&clock),
            Arc::clone(&ids),
            self.stagger,
            self.policies.batch.max_attempts,
        );
        let settings = Arc::new(DeliverySettings {
            policies: self.policies,
            delivery_timeout: self.delivery_timeout,
            from: self.from,
        });

        Ok(Dispatcher {
            store,
            queue,
            renderer,
            transport,
            clock,
            ids,
            settings,
            orchestrator,
            reset_url: self.reset_url,
            reap: self.reap,
            reap_interval: self.reap_interval,
        })
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
