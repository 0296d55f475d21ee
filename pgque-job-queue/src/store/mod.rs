//! Persistence, advisory locks and notifications behind one interface.
//!
//! [`PgJobStore`] is the production backend. [`MemoryStore`] emulates the same
//! semantics in-process, including per-session advisory locks that vanish
//! when their session is dropped, so the locker can be driven end to end
//! without a database.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::JobQueueError;
use crate::types::{JobClassStats, JobRecord, Metajob, NewJob};

pub use memory::MemoryStore;
pub use postgres::{PgJobStore, JOBS_TABLE};

/// Which rows a claim may consider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Only claim from these queues. Empty means every queue.
    pub queue_names: Vec<String>,
    /// Only claim rows with `priority <= max_priority`.
    pub max_priority: Option<i16>,
}

impl ClaimFilter {
    pub fn accepts(&self, queue: &str, priority: i16) -> bool {
        (self.queue_names.is_empty() || self.queue_names.iter().any(|q| q == queue))
            && self.max_priority.map_or(true, |max| priority <= max)
    }
}

/// Job table operations.
///
/// Mutations are keyed by id and are only valid while the caller's locker
/// holds the job's advisory lock.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// The store's clock.
    async fn now(&self) -> Result<DateTime<Utc>, JobQueueError>;

    /// Insert a row and publish its notification atomically.
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, JobQueueError>;

    /// Any row, regardless of state.
    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError>;

    /// The row, only if it is still non-terminal and due.
    async fn load_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError>;

    async fn finish_job(&self, id: i64) -> Result<(), JobQueueError>;

    /// Bump `error_count`, push `run_at` out by `interval` and record `error`
    /// (when given) as the last error.
    async fn retry_job(
        &self,
        id: i64,
        interval: Duration,
        error: Option<&str>,
    ) -> Result<(), JobQueueError>;

    /// Mark the row expired. With an `error`, also bump `error_count` and
    /// record it.
    async fn expire_job(&self, id: i64, error: Option<&str>) -> Result<(), JobQueueError>;

    async fn destroy_job(&self, id: i64) -> Result<(), JobQueueError>;

    /// Open an exclusive session for claiming and holding advisory locks.
    async fn claim_session(&self) -> Result<Box<dyn ClaimSession>, JobQueueError>;

    /// Subscribe to new-job notifications.
    async fn listen(&self) -> Result<Box<dyn JobNotifications>, JobQueueError>;

    /// Per-class counts for non-terminal rows.
    async fn job_stats(&self) -> Result<Vec<JobClassStats>, JobQueueError>;

    /// Delete every row. Returns how many were removed.
    async fn clear(&self) -> Result<u64, JobQueueError>;
}

/// A single database session holding advisory locks.
///
/// Locks live exactly as long as the session: dropping or closing it
/// releases everything it holds.
#[async_trait]
pub trait ClaimSession: Send {
    /// Lock up to `limit` eligible rows, best first, skipping rows another
    /// session holds and the ids in `held` (already locked by this session).
    async fn claim(
        &mut self,
        filter: &ClaimFilter,
        held: &[i64],
        limit: usize,
    ) -> Result<Vec<Metajob>, JobQueueError>;

    /// Release one lock. Returns whether this session held it.
    async fn unlock(&mut self, id: i64) -> Result<bool, JobQueueError>;

    async fn unlock_all(&mut self) -> Result<(), JobQueueError>;

    /// End the session, releasing any locks it still holds.
    async fn close(self: Box<Self>) -> Result<(), JobQueueError>;
}

/// A live notification subscription.
#[async_trait]
pub trait JobNotifications: Send {
    /// Wait for the next raw payload. An error means the subscription is gone.
    async fn recv(&mut self) -> Result<String, JobQueueError>;
}
