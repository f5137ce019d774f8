//! Runtime configuration, read from `COURIER_*` environment variables.
//!
//! | variable                      | default                   |
//! |-------------------------------|---------------------------|
//! | `COURIER_WORKERS`             | 4                         |
//! | `COURIER_MAX_ATTEMPTS`        | 3                         |
//! | `COURIER_BATCH_MAX_ATTEMPTS`  | 3                         |
//! | `COURIER_BASE_DELAY_MS`       | 1000                      |
//! | `COURIER_MAX_DELAY_MS`        | 600000                    |
//! | `COURIER_JITTER_MS`           | 1000                      |
//! | `COURIER_DELIVERY_TIMEOUT_MS` | 30000                     |
//! | `COURIER_RESULT_TTL_SECS`     | 3600                      |
//! | `COURIER_STAGGER_STEP_MS`     | 200                       |
//! | `COURIER_STAGGER_BURST`       | 5                         |
//! | `COURIER_GC_INTERVAL_SECS`    | 60                        |
//! | `COURIER_LEASE_SECS`          | 120                       |
//! | `COURIER_REANNOUNCE_SECS`     | 30                        |
//! | `COURIER_REAP_INTERVAL_SECS`  | 10                        |
//! | `COURIER_FROM`                | `noreply@localhost`       |
//! | `COURIER_RESET_URL`           | `https://localhost/reset-password` |
//!
//! Unset or empty variables take the default; unparsable ones are errors.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{RetryPolicies, RetryPolicy, StaggerPolicy};
use crate::observability::millis;
use crate::ports::ReapPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourierConfig {
    pub workers: usize,
    pub retry: RetryPolicies,
    pub delivery_timeout: Duration,
    pub result_ttl: Duration,
    pub stagger: StaggerPolicy,
    pub gc_interval: Duration,
    /// Claim lease and re-announce grace for the reaper.
    pub reap: ReapPolicy,
    pub reap_interval: Duration,
    /// Sender address on every envelope.
    pub from: String,
    /// Password reset links are `{reset_url}?token={token}`.
    pub reset_url: String,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicies::default(),
            delivery_timeout: Duration::from_secs(30),
            result_ttl: Duration::from_secs(3600),
            stagger: StaggerPolicy::default(),
            gc_interval: Duration::from_secs(60),
            reap: ReapPolicy::default(),
            reap_interval: Duration::from_secs(10),
            from: "noreply@localhost".to_string(),
            reset_url: "https://localhost/reset-password".to_string(),
        }
    }
}

impl CourierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let env = Lookup(lookup);

        let base = RetryPolicy::default_v1();
        let base = RetryPolicy {
            base_delay: env.millis("COURIER_BASE_DELAY_MS", base.base_delay)?,
            max_delay: env.millis("COURIER_MAX_DELAY_MS", base.max_delay)?,
            jitter: env.millis("COURIER_JITTER_MS", base.jitter)?,
            ..base
        };
        let single = RetryPolicy {
            max_attempts: env.parsed("COURIER_MAX_ATTEMPTS", base.max_attempts)?,
            ..base.clone()
        };
        let batch = RetryPolicy {
            max_attempts: env.parsed("COURIER_BATCH_MAX_ATTEMPTS", base.max_attempts)?,
            ..base
        };
        if single.max_attempts == 0 {
            return Err(invalid("COURIER_MAX_ATTEMPTS", "0"));
        }
        if batch.max_attempts == 0 {
            return Err(invalid("COURIER_BATCH_MAX_ATTEMPTS", "0"));
        }

        let stagger = StaggerPolicy::new(
            env.millis("COURIER_STAGGER_STEP_MS", defaults.stagger.step)?,
            env.parsed("COURIER_STAGGER_BURST", defaults.stagger.burst)?,
        );

        let config = Self {
            workers: env.parsed("COURIER_WORKERS", defaults.workers)?,
            retry: RetryPolicies { single, batch },
            delivery_timeout: env.millis("COURIER_DELIVERY_TIMEOUT_MS", defaults.delivery_timeout)?,
            result_ttl: env.secs("COURIER_RESULT_TTL_SECS", defaults.result_ttl)?,
            stagger,
            gc_interval: env.secs("COURIER_GC_INTERVAL_SECS", defaults.gc_interval)?,
            reap: ReapPolicy {
                lease: env.secs("COURIER_LEASE_SECS", defaults.reap.lease)?,
                announce_after: env.secs("COURIER_REANNOUNCE_SECS", defaults.reap.announce_after)?,
            },
            reap_interval: env.secs("COURIER_REAP_INTERVAL_SECS", defaults.reap_interval)?,
            from: env.string("COURIER_FROM", defaults.from),
            reset_url: env.string("COURIER_RESET_URL", defaults.reset_url),
        };
        if config.gc_interval.is_zero() {
            return Err(invalid("COURIER_GC_INTERVAL_SECS", "0"));
        }
        if config.reap_interval.is_zero() {
            return Err(invalid("COURIER_REAP_INTERVAL_SECS", "0"));
        }
        if config.reap.lease <= config.delivery_timeout {
            return Err(invalid(
                "COURIER_LEASE_SECS",
                &config.reap.lease.as_secs().to_string(),
            ));
        }
        Ok(config)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| invalid(key, &raw)),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(key, millis(default))
            .map(Duration::from_millis)
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(key, default.as_secs()).map(Duration::from_secs)
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }
}
