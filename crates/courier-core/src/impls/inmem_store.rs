//! In-memory result store.
//!
//! # Implementation
//! - One `tokio::sync::Mutex` around all records: each trait method is a
//!   single critical section, which makes claim/complete compare-and-swap
//!   operations for free.
//! - Completing a batch dependent updates the parent inside the same critical
//!   section (single-writer aggregation), so `completed` can never lose an
//!   increment and is never observed out of step with the dependents. A
//!   dependent settles once because only its owner can complete it, and a
//!   terminal record has no owner.
//! - Changes are applied to copies and committed together at the end.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{
    ClaimConflict, JobId, JobPayload, JobRecord, JobState, TransitionError, WorkerId,
};
use crate::observability::StateCounts;
use crate::ports::{
    ClaimOutcome, Completed, Completion, ReapPolicy, Reaped, ResultStore, StoreError,
};

pub struct InMemoryResultStore {
    records: Mutex<HashMap<JobId, JobRecord>>,
    retention: chrono::Duration,
}

impl InMemoryResultStore {
    /// `retention` is how long terminal records stay queryable.
    pub fn new(retention: std::time::Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            retention: to_chrono(retention),
        }
    }

    /// Terminal records start their retention window.
    fn seal(&self, record: &mut JobRecord, now: DateTime<Utc>) {
        if record.is_terminal() && record.expires_at.is_none() {
            record.expires_at = Some(
                now.checked_add_signed(self.retention)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            );
        }
    }

    /// Fold a record that just became terminal into its parent batch.
    /// Returns the updated parent, sealed but not yet committed.
    fn settle_parent(
        &self,
        records: &HashMap<JobId, JobRecord>,
        record: &JobRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, TransitionError> {
        let (true, Some(parent_id)) = (record.is_terminal(), record.parent) else {
            return Ok(None);
        };
        let Some(mut batch) = records.get(&parent_id).cloned() else {
            warn!(job_id = %record.id, parent_id = %parent_id, "parent batch missing; dependent outcome not aggregated");
            return Ok(None);
        };
        let recipient = match &record.payload {
            JobPayload::SingleDelivery(p) => p.to.as_str(),
            JobPayload::BatchDelivery(_) => "",
        };
        let outcome = match &record.state {
            JobState::Failed { error } => Err(error.clone()),
            _ => Ok(()),
        };
        batch.settle_dependent(recipient, outcome, now)?;
        self.seal(&mut batch, now);
        Ok(Some(batch))
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(3600))
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn apply(
    record: &mut JobRecord,
    worker: WorkerId,
    completion: Completion,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    match completion {
        Completion::Succeeded(result) => record.succeed(worker, result, now),
        Completion::Retrying {
            next_attempt_at,
            error,
        } => record.schedule_retry(worker, next_attempt_at, error, now),
        Completion::Failed(error) => record.fail(worker, error, now),
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn insert_batch(
        &self,
        mut batch: JobRecord,
        dependents: Vec<JobRecord>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if let Some(taken) = std::iter::once(&batch)
            .chain(dependents.iter())
            .find(|r| records.contains_key(&r.id))
        {
            return Err(StoreError::Duplicate(taken.id));
        }
        // an empty batch arrives already finalized
        let finalized_at = batch.updated_at;
        self.seal(&mut batch, finalized_at);
        for record in dependents {
            records.insert(record.id, record);
        }
        records.insert(batch.id, batch);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.get(&id).cloned())
    }

    async fn claim(
        &self,
        id: JobId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&id) else {
            return Ok(ClaimOutcome::Conflict(ClaimConflict::Missing));
        };
        match record.claim(worker, now) {
            Ok(()) => Ok(ClaimOutcome::Claimed(record.clone())),
            Err(conflict) => Ok(ClaimOutcome::Conflict(conflict)),
        }
    }

    async fn complete(
        &self,
        id: JobId,
        worker: WorkerId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Completed, StoreError> {
        let mut records = self.records.lock().await;

        let mut record = records.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        apply(&mut record, worker, completion, now)?;
        self.seal(&mut record, now);
        let parent = self.settle_parent(&records, &record, now)?;

        records.insert(id, record.clone());
        if let Some(batch) = &parent {
            records.insert(batch.id, batch.clone());
        }
        Ok(Completed { record, parent })
    }

    async fn reap(&self, now: DateTime<Utc>, policy: ReapPolicy) -> Result<Reaped, StoreError> {
        let lease = to_chrono(policy.lease);
        let grace = to_chrono(policy.announce_after);
        let mut records = self.records.lock().await;
        let mut reaped = Reaped::default();

        for record in records.values_mut() {
            if record.is_stale(now, grace) {
                record.announced_at = Some(now);
                reaped.announce.push(record.id);
            }
        }

        let expired: Vec<JobId> = records
            .values()
            .filter(|record| record.lease_expired(now, lease))
            .map(|record| record.id)
            .collect();
        for id in expired {
            let Some(mut record) = records.get(&id).cloned() else {
                continue;
            };
            record.expire_lease(now)?;
            self.seal(&mut record, now);
            let parent = match self.settle_parent(&records, &record, now) {
                Ok(parent) => parent,
                Err(err) => {
                    warn!(job_id = %id, %err, "expired dependent could not settle its batch; left in place");
                    continue;
                }
            };
            if !record.is_terminal() {
                record.announced_at = Some(now);
                reaped.announce.push(id);
            }
            records.insert(id, record);
            if let Some(batch) = parent {
                records.insert(batch.id, batch);
            }
            reaped.expired.push(id);
        }

        if !reaped.announce.is_empty() || !reaped.expired.is_empty() {
            debug!(
                announce = reaped.announce.len(),
                expired = reaped.expired.len(),
                "reaped job records"
            );
        }
        Ok(reaped)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at.is_none_or(|at| at > now));
        let purged = before - records.len();
        if purged > 0 {
            debug!(purged, "purged expired job records");
        }
        Ok(purged)
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        let records = self.records.lock().await;
        let mut counts = StateCounts::default();
        for record in records.values() {
            match record.state {
                JobState::Pending => counts.pending += 1,
                JobState::InProgress { .. } => counts.in_progress += 1,
                JobState::Retrying { .. } => counts.retrying += 1,
                JobState::Succeeded { .. } => counts.succeeded += 1,
                JobState::Failed { .. } => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::TimeZone;
    use ulid::Ulid;

    use super::*;
    use crate::domain::{
        BatchPayload, Context, DeliveryError, DeliveryReceipt, JobResult, Recipient,
        SinglePayload, TemplateRef,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn new_id() -> JobId {
        JobId::from_ulid(Ulid::new())
    }

    fn worker() -> WorkerId {
        WorkerId::from_ulid(Ulid::new())
    }

    fn payload(to: &str) -> SinglePayload {
        SinglePayload {
            to: to.into(),
            subject: "s".into(),
            template: TemplateRef::inline("x"),
            text_template: None,
            context: Context::new(),
        }
    }

    fn receipt(to: &str) -> JobResult {
        JobResult::Delivered(DeliveryReceipt {
            to: to.into(),
            subject: "s".into(),
            message: "sent".into(),
        })
    }

    /// Batch (already claimed by the returned worker) plus its dependents.
    async fn seeded_batch(store: &InMemoryResultStore, emails: &[&str]) -> (JobId, WorkerId, Vec<JobId>) {
        let batch_id = new_id();
        let mut batch = JobRecord::batch(
            batch_id,
            BatchPayload {
                recipients: emails.iter().map(|e| Recipient::new(*e)).collect(),
                subject: "s".into(),
                template: TemplateRef::inline("x"),
                shared_context: Context::new(),
            },
            t0(),
        );
        let dependents: Vec<JobRecord> = emails
            .iter()
            .map(|e| JobRecord::dependent(new_id(), batch_id, payload(e), 3, t0()))
            .collect();
        batch.dependents = dependents.iter().map(|d| d.id).collect();
        let ids = batch.dependents.clone();
        store.insert_batch(batch, dependents).await.unwrap();

        let owner = worker();
        assert!(matches!(
            store.claim(batch_id, owner, t0()).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        (batch_id, owner, ids)
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let store = Arc::new(InMemoryResultStore::default());
        let id = new_id();
        store
            .insert(JobRecord::single(id, payload("a@example.com"), 3, t0()))
            .await
            .unwrap();

        let mut joins = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                store.claim(id, worker(), t0()).await.unwrap()
            }));
        }
        let mut winners = 0;
        for join in joins {
            if let ClaimOutcome::Claimed(_) = join.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn claiming_unknown_job_is_a_benign_conflict() {
        let store = InMemoryResultStore::default();
        let outcome = store.claim(new_id(), worker(), t0()).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Conflict(ClaimConflict::Missing));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryResultStore::default();
        let record = JobRecord::single(new_id(), payload("a@example.com"), 3, t0());
        store.insert(record.clone()).await.unwrap();

        assert!(matches!(
            store.insert(record).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn complete_by_non_owner_leaves_record_untouched() {
        let store = InMemoryResultStore::default();
        let id = new_id();
        store
            .insert(JobRecord::single(id, payload("a@example.com"), 3, t0()))
            .await
            .unwrap();
        let owner = worker();
        store.claim(id, owner, t0()).await.unwrap();

        let err = store
            .complete(id, worker(), Completion::Succeeded(receipt("a@example.com")), t0())
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Transition(TransitionError::NotOwner { .. })));
        assert!(matches!(
            store.get(id).await.unwrap().unwrap().state,
            JobState::InProgress { .. }
        ));
    }

    #[tokio::test]
    async fn terminal_records_expire_after_retention() {
        let store = InMemoryResultStore::new(Duration::from_secs(3600));
        let id = new_id();
        store
            .insert(JobRecord::single(id, payload("a@example.com"), 3, t0()))
            .await
            .unwrap();
        let owner = worker();
        store.claim(id, owner, t0()).await.unwrap();
        let done = store
            .complete(id, owner, Completion::Succeeded(receipt("a@example.com")), t0())
            .await
            .unwrap();
        assert_eq!(done.record.expires_at, Some(t0() + chrono::Duration::hours(1)));

        assert_eq!(store.purge_expired(t0() + chrono::Duration::minutes(59)).await.unwrap(), 0);
        assert_eq!(store.purge_expired(t0() + chrono::Duration::hours(1)).await.unwrap(), 1);
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retrying_records_do_not_expire() {
        let store = InMemoryResultStore::new(Duration::from_secs(1));
        let id = new_id();
        store
            .insert(JobRecord::single(id, payload("a@example.com"), 3, t0()))
            .await
            .unwrap();
        let owner = worker();
        store.claim(id, owner, t0()).await.unwrap();
        store
            .complete(
                id,
                owner,
                Completion::Retrying {
                    next_attempt_at: t0() + chrono::Duration::seconds(2),
                    error: DeliveryError::transient("reset"),
                },
                t0(),
            )
            .await
            .unwrap();

        assert_eq!(store.purge_expired(t0() + chrono::Duration::days(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dependent_completion_updates_parent_in_same_step() {
        let store = InMemoryResultStore::default();
        let (batch_id, _, deps) = seeded_batch(&store, &["a@example.com", "b@example.com"]).await;

        let w = worker();
        store.claim(deps[0], w, t0()).await.unwrap();
        let done = store
            .complete(deps[0], w, Completion::Succeeded(receipt("a@example.com")), t0())
            .await
            .unwrap();
        let parent = done.parent.unwrap();
        assert_eq!(parent.progress.as_ref().unwrap().completed, 1);
        assert!(!parent.is_terminal());

        store.claim(deps[1], w, t0()).await.unwrap();
        let done = store
            .complete(
                deps[1],
                w,
                Completion::Failed(DeliveryError::permanent("bounced")),
                t0(),
            )
            .await
            .unwrap();
        let parent = done.parent.unwrap();
        assert!(parent.is_terminal());
        assert!(parent.expires_at.is_some());

        let stored = store.get(batch_id).await.unwrap().unwrap();
        let progress = stored.progress.unwrap();
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.failures[0].recipient, "b@example.com");
    }

    #[tokio::test]
    async fn retry_of_a_dependent_does_not_touch_parent() {
        let store = InMemoryResultStore::default();
        let (batch_id, _, deps) = seeded_batch(&store, &["a@example.com"]).await;

        let w = worker();
        store.claim(deps[0], w, t0()).await.unwrap();
        let done = store
            .complete(
                deps[0],
                w,
                Completion::Retrying {
                    next_attempt_at: t0(),
                    error: DeliveryError::transient("reset"),
                },
                t0(),
            )
            .await
            .unwrap();

        assert!(done.parent.is_none());
        let batch = store.get(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.progress.unwrap().completed, 0);
    }

    #[tokio::test]
    async fn parallel_dependent_completions_lose_no_updates() {
        let store = Arc::new(InMemoryResultStore::default());
        let emails: Vec<String> = (0..50).map(|i| format!("r{i}@example.com")).collect();
        let refs: Vec<&str> = emails.iter().map(String::as_str).collect();
        let (batch_id, _, deps) = seeded_batch(&store, &refs).await;

        let mut joins = Vec::new();
        for (dep, email) in deps.into_iter().zip(emails.clone()) {
            let store = Arc::clone(&store);
            joins.push(tokio::spawn(async move {
                let w = worker();
                store.claim(dep, w, t0()).await.unwrap();
                store
                    .complete(dep, w, Completion::Succeeded(receipt(&email)), t0())
                    .await
                    .unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        let batch = store.get(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.progress.as_ref().unwrap().completed, 50);
        assert!(matches!(batch.state, JobState::Succeeded { .. }));
    }

    #[tokio::test]
    async fn counts_follow_states() {
        let store = InMemoryResultStore::default();
        let (_, _, deps) = seeded_batch(&store, &["a@example.com", "b@example.com"]).await;
        store.claim(deps[0], worker(), t0()).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.in_progress, 2); // batch + claimed dependent
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 3);
    }

    fn policy() -> ReapPolicy {
        ReapPolicy {
            lease: Duration::from_secs(120),
            announce_after: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn reap_announces_records_left_unclaimed() {
        let store = InMemoryResultStore::default();
        let id = new_id();
        store
            .insert(JobRecord::single(id, payload("a@example.com"), 3, t0()))
            .await
            .unwrap();

        let early = store.reap(t0() + chrono::Duration::seconds(29), policy()).await.unwrap();
        assert!(early.announce.is_empty());

        let due = store.reap(t0() + chrono::Duration::seconds(30), policy()).await.unwrap();
        assert_eq!(due.announce, vec![id]);

        // stamped: not announced again until another grace period passes
        let again = store.reap(t0() + chrono::Duration::seconds(45), policy()).await.unwrap();
        assert!(again.announce.is_empty());
        let later = store.reap(t0() + chrono::Duration::seconds(60), policy()).await.unwrap();
        assert_eq!(later.announce, vec![id]);
    }

    #[tokio::test]
    async fn reap_takes_back_an_abandoned_claim() {
        let store = InMemoryResultStore::default();
        let id = new_id();
        store
            .insert(JobRecord::single(id, payload("a@example.com"), 3, t0()))
            .await
            .unwrap();
        let owner = worker();
        store.claim(id, owner, t0()).await.unwrap();

        let held = store.reap(t0() + chrono::Duration::seconds(119), policy()).await.unwrap();
        assert_eq!(held, Reaped::default());

        let expired_at = t0() + chrono::Duration::seconds(120);
        let reaped = store.reap(expired_at, policy()).await.unwrap();
        assert_eq!(reaped.expired, vec![id]);
        assert_eq!(reaped.announce, vec![id]);

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Retrying { next_attempt_at: expired_at });
        assert_eq!(record.attempt_count, 1);

        // the late owner can no longer complete
        let late = store
            .complete(id, owner, Completion::Succeeded(receipt("a@example.com")), expired_at)
            .await;
        assert!(matches!(late, Err(StoreError::Transition(TransitionError::NotInProgress { .. }))));
        assert!(matches!(
            store.claim(id, worker(), expired_at).await.unwrap(),
            ClaimOutcome::Claimed(r) if r.attempt_count == 2
        ));
    }

    #[tokio::test]
    async fn expired_final_attempt_fails_and_settles_the_batch() {
        let store = InMemoryResultStore::default();
        let batch_id = new_id();
        let mut batch = JobRecord::batch(
            batch_id,
            BatchPayload {
                recipients: vec![Recipient::new("a@example.com")],
                subject: "s".into(),
                template: TemplateRef::inline("x"),
                shared_context: Context::new(),
            },
            t0(),
        );
        let dependent = JobRecord::dependent(new_id(), batch_id, payload("a@example.com"), 1, t0());
        let dep_id = dependent.id;
        batch.dependents = vec![dep_id];
        batch.claim(worker(), t0()).unwrap();
        store.insert_batch(batch, vec![dependent]).await.unwrap();
        store.claim(dep_id, worker(), t0()).await.unwrap();

        let reaped = store.reap(t0() + chrono::Duration::hours(1), policy()).await.unwrap();

        assert_eq!(reaped.expired, vec![dep_id]);
        assert!(reaped.announce.is_empty());
        let dep = store.get(dep_id).await.unwrap().unwrap();
        assert!(matches!(
            dep.state,
            JobState::Failed { error: DeliveryError::RetryExhausted { attempts: 1, .. } }
        ));
        let batch = store.get(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.progress.as_ref().unwrap().completed, 1);
        assert!(matches!(batch.state, JobState::Failed { .. }));
    }

    #[tokio::test]
    async fn finalized_empty_batch_is_sealed_on_insert() {
        let store = InMemoryResultStore::new(Duration::from_secs(60));
        let batch_id = new_id();
        let mut batch = JobRecord::batch(
            batch_id,
            BatchPayload {
                recipients: vec![],
                subject: "s".into(),
                template: TemplateRef::inline("x"),
                shared_context: Context::new(),
            },
            t0(),
        );
        batch.claim(worker(), t0()).unwrap();
        batch.finalize_batch(t0());
        store.insert_batch(batch, vec![]).await.unwrap();

        let stored = store.get(batch_id).await.unwrap().unwrap();
        assert_eq!(stored.expires_at, Some(t0() + chrono::Duration::seconds(60)));
    }
}
