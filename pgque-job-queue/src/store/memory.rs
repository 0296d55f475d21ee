//! In-process job store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{ClaimFilter, ClaimSession, JobNotifications, JobStore};
use crate::error::JobQueueError;
use crate::notification::{JobNotification, POLL_SENTINEL};
use crate::types::{JobClassStats, JobRecord, Metajob, NewJob, SCHEMA_VERSION};

const NOTIFICATION_BUFFER: usize = 256;

#[derive(Debug)]
struct MemoryState {
    next_id: i64,
    next_session: u64,
    jobs: BTreeMap<i64, JobRecord>,
    /// Advisory locks: job id to owning session.
    locks: HashMap<i64, u64>,
    /// Added to the wall clock by [`MemoryStore::advance`].
    offset: chrono::Duration,
}

impl MemoryState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    fn job_mut(&mut self, id: i64) -> Result<&mut JobRecord, JobQueueError> {
        self.jobs.get_mut(&id).ok_or(JobQueueError::NotFound(id))
    }

    fn release_session(&mut self, session: u64) {
        self.locks.retain(|_, owner| *owner != session);
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MemoryState>,
    notifications: broadcast::Sender<String>,
    failing_claims: AtomicUsize,
    rejected_claims: AtomicUsize,
}

/// Job store backed by process memory.
///
/// Clones share the same table, locks and notification channel.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryState {
                    next_id: 1,
                    next_session: 0,
                    jobs: BTreeMap::new(),
                    locks: HashMap::new(),
                    offset: chrono::Duration::zero(),
                }),
                notifications,
                failing_claims: AtomicUsize::new(0),
                rejected_claims: AtomicUsize::new(0),
            }),
        }
    }

    /// Move this store's clock forward.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut state = self.shared.state.lock();
        state.offset = state.offset + by;
    }

    /// Make the next `count` claim round-trips fail as if the session dropped.
    pub fn fail_next_claims(&self, count: usize) {
        self.shared.failing_claims.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` claim queries fail while the session itself
    /// stays healthy.
    pub fn reject_next_claims(&self, count: usize) {
        self.shared.rejected_claims.store(count, Ordering::SeqCst);
    }

    /// How many claim sessions have been opened so far.
    pub fn sessions_opened(&self) -> u64 {
        self.shared.state.lock().next_session
    }

    /// Whether any session currently holds the lock for `id`.
    pub fn is_locked(&self, id: i64) -> bool {
        self.shared.state.lock().locks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().jobs.is_empty()
    }

    fn take_claim_failure(&self) -> Option<JobQueueError> {
        let take = |counter: &AtomicUsize| {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        };
        if take(&self.shared.failing_claims) {
            Some(JobQueueError::SessionClosed)
        } else if take(&self.shared.rejected_claims) {
            Some(JobQueueError::Store(sqlx::Error::RowNotFound))
        } else {
            None
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn now(&self) -> Result<DateTime<Utc>, JobQueueError> {
        Ok(self.shared.state.lock().now())
    }

    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, JobQueueError> {
        let record = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let run_at = job.run_at.unwrap_or_else(|| state.now());
            let record = JobRecord {
                id,
                queue: job.queue,
                priority: job.priority,
                run_at,
                first_run_at: run_at,
                job_class: job.job_class,
                args: job.args,
                kwargs: job.kwargs,
                data: job.data,
                error_count: 0,
                last_error: None,
                expired_at: None,
                finished_at: None,
                schema_version: SCHEMA_VERSION,
            };
            state.jobs.insert(id, record.clone());
            record
        };
        // No subscribers is fine.
        let _ = self
            .shared
            .notifications
            .send(JobNotification::from(&record).encode());
        Ok(record)
    }

    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError> {
        Ok(self.shared.state.lock().jobs.get(&id).cloned())
    }

    async fn load_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError> {
        let state = self.shared.state.lock();
        let now = state.now();
        Ok(state
            .jobs
            .get(&id)
            .filter(|job| job.is_eligible_at(now))
            .cloned())
    }

    async fn finish_job(&self, id: i64) -> Result<(), JobQueueError> {
        let mut state = self.shared.state.lock();
        let now = state.now();
        state.job_mut(id)?.finished_at = Some(now);
        Ok(())
    }

    async fn retry_job(
        &self,
        id: i64,
        interval: Duration,
        error: Option<&str>,
    ) -> Result<(), JobQueueError> {
        let mut state = self.shared.state.lock();
        let now = state.now();
        let job = state.job_mut(id)?;
        job.error_count += 1;
        job.run_at = chrono::Duration::from_std(interval)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(now);
        if let Some(error) = error {
            job.last_error = Some(error.to_owned());
        }
        Ok(())
    }

    async fn expire_job(&self, id: i64, error: Option<&str>) -> Result<(), JobQueueError> {
        let mut state = self.shared.state.lock();
        let now = state.now();
        let job = state.job_mut(id)?;
        job.expired_at = Some(now);
        if let Some(error) = error {
            job.error_count += 1;
            job.last_error = Some(error.to_owned());
        }
        Ok(())
    }

    async fn destroy_job(&self, id: i64) -> Result<(), JobQueueError> {
        self.shared
            .state
            .lock()
            .jobs
            .remove(&id)
            .map(|_| ())
            .ok_or(JobQueueError::NotFound(id))
    }

    async fn claim_session(&self) -> Result<Box<dyn ClaimSession>, JobQueueError> {
        let session = {
            let mut state = self.shared.state.lock();
            state.next_session += 1;
            state.next_session
        };
        Ok(Box::new(MemorySession {
            store: self.clone(),
            session,
        }))
    }

    async fn listen(&self) -> Result<Box<dyn JobNotifications>, JobQueueError> {
        Ok(Box::new(MemoryNotifications {
            receiver: self.shared.notifications.subscribe(),
        }))
    }

    async fn job_stats(&self) -> Result<Vec<JobClassStats>, JobQueueError> {
        let state = self.shared.state.lock();
        let mut by_class: BTreeMap<&str, JobClassStats> = BTreeMap::new();
        for job in state.jobs.values().filter(|job| !job.is_terminal()) {
            let stats = by_class
                .entry(job.job_class.as_str())
                .or_insert_with(|| JobClassStats {
                    job_class: job.job_class.clone(),
                    count: 0,
                    count_working: 0,
                    count_errored: 0,
                    highest_error_count: 0,
                    oldest_run_at: None,
                });
            stats.count += 1;
            if state.locks.contains_key(&job.id) {
                stats.count_working += 1;
            }
            if job.error_count > 0 {
                stats.count_errored += 1;
            }
            stats.highest_error_count = stats.highest_error_count.max(job.error_count);
            stats.oldest_run_at = Some(
                stats
                    .oldest_run_at
                    .map_or(job.run_at, |oldest| oldest.min(job.run_at)),
            );
        }
        let mut stats: Vec<JobClassStats> = by_class.into_values().collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(stats)
    }

    async fn clear(&self) -> Result<u64, JobQueueError> {
        let mut state = self.shared.state.lock();
        let removed = state.jobs.len() as u64;
        state.jobs.clear();
        Ok(removed)
    }
}

/// One emulated database session.
struct MemorySession {
    store: MemoryStore,
    session: u64,
}

#[async_trait]
impl ClaimSession for MemorySession {
    async fn claim(
        &mut self,
        filter: &ClaimFilter,
        held: &[i64],
        limit: usize,
    ) -> Result<Vec<Metajob>, JobQueueError> {
        if let Some(err) = self.store.take_claim_failure() {
            return Err(err);
        }

        let mut state = self.store.shared.state.lock();
        let now = state.now();
        let mut candidates: Vec<Metajob> = state
            .jobs
            .values()
            .filter(|job| job.is_eligible_at(now))
            .filter(|job| filter.accepts(&job.queue, job.priority))
            .filter(|job| !held.contains(&job.id))
            .map(JobRecord::metajob)
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for metajob in candidates {
            if claimed.len() >= limit {
                break;
            }
            // Held elsewhere: skip without waiting.
            if state.locks.contains_key(&metajob.id) {
                continue;
            }
            state.locks.insert(metajob.id, self.session);
            claimed.push(metajob);
        }
        Ok(claimed)
    }

    async fn unlock(&mut self, id: i64) -> Result<bool, JobQueueError> {
        let mut state = self.store.shared.state.lock();
        if state.locks.get(&id) == Some(&self.session) {
            state.locks.remove(&id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn unlock_all(&mut self) -> Result<(), JobQueueError> {
        self.store.shared.state.lock().release_session(self.session);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), JobQueueError> {
        // Drop releases the locks.
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.shared.state.lock().release_session(self.session);
    }
}

struct MemoryNotifications {
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl JobNotifications for MemoryNotifications {
    async fn recv(&mut self) -> Result<String, JobQueueError> {
        match self.receiver.recv().await {
            Ok(payload) => Ok(payload),
            // Missed some: poll everything.
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(POLL_SENTINEL.to_owned()),
            Err(broadcast::error::RecvError::Closed) => Err(JobQueueError::SessionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn new_job(priority: i16, run_at: Option<DateTime<Utc>>) -> NewJob {
        NewJob {
            queue: "default".to_owned(),
            priority,
            run_at,
            job_class: "demo".to_owned(),
            args: Vec::new(),
            kwargs: Map::new(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn claims_best_rows_first_and_respects_limit() {
        let store = MemoryStore::new();
        let low = store.enqueue(new_job(5, None)).await.unwrap();
        let high = store.enqueue(new_job(1, None)).await.unwrap();
        let _other = store.enqueue(new_job(5, None)).await.unwrap();

        let mut session = store.claim_session().await.unwrap();
        let claimed = session.claim(&ClaimFilter::default(), &[], 2).await.unwrap();
        let ids: Vec<i64> = claimed.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    #[tokio::test]
    async fn locked_rows_are_skipped_by_other_sessions() {
        let store = MemoryStore::new();
        let job = store.enqueue(new_job(1, None)).await.unwrap();

        let mut first = store.claim_session().await.unwrap();
        let mut second = store.claim_session().await.unwrap();
        assert_eq!(first.claim(&ClaimFilter::default(), &[], 1).await.unwrap().len(), 1);
        assert!(second.claim(&ClaimFilter::default(), &[], 1).await.unwrap().is_empty());

        // Dropping the holder releases its locks.
        drop(first);
        assert!(!store.is_locked(job.id));
        let reclaimed = second.claim(&ClaimFilter::default(), &[], 1).await.unwrap();
        assert_eq!(reclaimed.first().map(|m| m.id), Some(job.id));
    }

    #[tokio::test]
    async fn future_rows_wait_for_the_clock() {
        let store = MemoryStore::new();
        let later = store.now().await.unwrap() + chrono::Duration::seconds(60);
        store.enqueue(new_job(1, Some(later))).await.unwrap();

        let mut session = store.claim_session().await.unwrap();
        assert!(session.claim(&ClaimFilter::default(), &[], 1).await.unwrap().is_empty());
        store.advance(Duration::from_secs(61));
        assert_eq!(session.claim(&ClaimFilter::default(), &[], 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn job_stats_counts_working_and_errored_rows() {
        let store = MemoryStore::new();
        let a = store.enqueue(new_job(1, None)).await.unwrap();
        store.enqueue(new_job(2, None)).await.unwrap();
        let done = store.enqueue(new_job(3, None)).await.unwrap();
        store.finish_job(done.id).await.unwrap();
        store.retry_job(a.id, Duration::ZERO, Some("boom")).await.unwrap();

        let mut session = store.claim_session().await.unwrap();
        session.claim(&ClaimFilter::default(), &[], 1).await.unwrap();

        let stats = store.job_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 2);
        assert_eq!(stats[0].count_working, 1);
        assert_eq!(stats[0].count_errored, 1);
        assert_eq!(stats[0].highest_error_count, 1);
    }

    #[tokio::test]
    async fn enqueue_publishes_a_notification() {
        let store = MemoryStore::new();
        let mut notifications = store.listen().await.unwrap();
        let job = store.enqueue(new_job(4, None)).await.unwrap();

        let payload = notifications.recv().await.unwrap();
        let parsed = JobNotification::parse(&payload).unwrap();
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.priority, 4);
    }
}
