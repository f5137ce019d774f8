//! IdGenerator port - id generation behind a trait.
//!
//! # Implementation
//! - **UlidGenerator**: ULID with the timestamp taken from a `Clock`.

use crate::domain::ids::{JobId, WorkerId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn job_id(&self) -> JobId;

    fn worker_id(&self) -> WorkerId;
}

/// ULID generator: timestamp from the clock, randomness from `rand`.
///
/// With a `FixedClock` every id shares the same timestamp part, so the
/// ordering of ids generated in tests is not meaningful.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn job_id(&self) -> JobId {
        JobId::from(self.next())
    }

    fn worker_id(&self) -> WorkerId {
        WorkerId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.job_id();
        let id2 = id_gen.job_id();

        assert_ne!(id1, id2);
    }

    #[test]
    fn timestamp_part_comes_from_the_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.job_id();
        let id2 = id_gen.worker_id();

        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert!(id2.to_string().starts_with("worker-"));
    }
}
