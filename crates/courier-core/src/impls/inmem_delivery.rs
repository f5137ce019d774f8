//! InMemoryDeliveryQueue - development delivery queue with delayed visibility.
//!
//! 開発・テスト用。プロセスが落ちると通知は消えるが、record はストアに残り
//! reaper が再通知する。
//!
//! # Implementation
//! - A min-heap ordered by visibility time (then push order)
//! - `tokio::sync::Mutex` held only inside `push` / `pop` bookkeeping, never
//!   across an await on the caller's work
//! - `Notify` wakes an idle `pop` when something is pushed
//! - `tokio::time::Instant`, so tests can run on paused time

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::ports::{DeliveryQueue, JobNotice, QueueError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    visible_at: Instant,
    seq: u64,
    notice: JobNotice,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the earliest entry first.
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

#[derive(Default)]
pub struct InMemoryDeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices waiting, visible or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn push(&self, notice: JobNotice, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Scheduled {
                visible_at: Instant::now() + delay,
                seq,
                notice,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<JobNotice>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let next_visible = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                match state.heap.peek().map(|top| top.visible_at) {
                    Some(at) if at <= now => {
                        let notice = state.heap.pop().map(|s| s.notice);
                        let more_visible = state
                            .heap
                            .peek()
                            .is_some_and(|next| next.visible_at <= now);
                        drop(state);
                        if more_visible {
                            // Pass the baton to another idle consumer.
                            self.notify.notify_one();
                        }
                        return Ok(notice);
                    }
                    later => later,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }
}
