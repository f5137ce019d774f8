//! Per-state record counts and log field helpers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of stored records per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.retrying + self.succeeded + self.failed
    }
}

/// Whole milliseconds for a `*_ms` log field, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
