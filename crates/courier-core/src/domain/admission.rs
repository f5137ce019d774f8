//! Admission control for batch fan-out.
//!
//! 元々の「1 件ごとに sleep」を置き換える。遅延は通知の可視時刻と
//! dependent の `not_before` の両方に載る。

use std::time::Duration;

/// Spreads dependent jobs over time to bound peak transport load.
///
/// Recipients are admitted in groups of `burst`; group `g` becomes visible to
/// workers `g * step` after the batch was submitted. The delay never decreases
/// with the recipient index. This is a smoothing mechanism, not a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerPolicy {
    pub step: Duration,
    pub burst: usize,
}

impl StaggerPolicy {
    pub fn new(step: Duration, burst: usize) -> Self {
        Self {
            step,
            burst: burst.max(1),
        }
    }

    /// Everything at once.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    pub fn delay_for(&self, index: usize) -> Duration {
        let group = u32::try_from(index / self.burst.max(1)).unwrap_or(u32::MAX);
        self.step.saturating_mul(group)
    }
}

impl Default for StaggerPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), 5)
    }
}
