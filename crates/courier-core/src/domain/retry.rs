//! Retry policy: attempt ceiling and backoff delays.
//!
//! 試行回数の上限と指数バックオフだけを持つ。transient / permanent の判定は
//! transport 側で済んでいる前提。

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and bounded jitter.
///
/// `delay(n) = min(base_delay * 2^n + jitter, max_delay)` where `n` is the
/// number of attempts already made and `jitter` is drawn from
/// `[0, min(self.jitter, base_delay)]`. Clamping the jitter to the base delay
/// and applying it before the cap keeps `delay(n + 1) >= delay(n)` for every
/// draw.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed in total, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Three attempts, 1s base, 10 minute cap, up to 1s jitter.
    pub fn default_v1() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(600),
            jitter: Duration::from_secs(1),
        }
    }

    /// Same policy without jitter; handy where delays must be exact.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    /// Deterministic part of the delay after `attempts` attempts.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff plus a random offset, capped.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let bound = self.jitter.min(self.base_delay);
        let offset = if bound.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=bound)
        };
        self.backoff(attempts)
            .saturating_add(offset)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}

/// Retry configuration per job kind.
///
/// A batch never retries as a unit; its policy applies to the single
/// deliveries it fans out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicies {
    pub single: RetryPolicy,
    pub batch: RetryPolicy,
}

impl RetryPolicies {
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            single: policy.clone(),
            batch: policy,
        }
    }

    /// Policy governing one delivery attempt. Dependents of a batch follow
    /// the batch policy.
    pub fn for_delivery(&self, is_dependent: bool) -> &RetryPolicy {
        if is_dependent { &self.batch } else { &self.single }
    }
}
