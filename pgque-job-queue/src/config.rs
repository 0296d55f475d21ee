//! Per-locker configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::JobQueueError;
use crate::middleware::JobMiddleware;
use crate::notifier::{ErrorNotifier, TracingNotifier};
use crate::retry::{RetryInterval, RetryPolicy};
use crate::store::ClaimFilter;

pub const DEFAULT_WORKER_COUNT: usize = 6;
pub const DEFAULT_JOB_QUEUE_CAPACITY: usize = 8;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WAIT_PERIOD: Duration = Duration::from_millis(50);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MINIMUM_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAXIMUM_BACKOFF: Duration = Duration::from_secs(30);

/// Everything one [`Locker`](crate::Locker) needs, passed at construction.
#[derive(Clone)]
pub struct LockerConfig {
    /// Size of the worker pool. Zero runs no workers and claims nothing.
    pub worker_count: usize,
    /// Optional priority ceiling per worker slot, by index. Slots past the end
    /// of this list take any priority.
    pub worker_priorities: Vec<Option<i16>>,
    /// Only claim from these queues. Empty means every queue.
    pub queue_names: Vec<String>,
    pub poll_interval: Duration,
    pub wait_for_notifications: bool,
    pub job_queue_capacity: usize,
    /// How long an idle worker waits on the job queue before re-checking for
    /// shutdown.
    pub wait_period: Duration,
    /// Grace period for in-flight jobs on stop.
    pub shutdown_timeout: Duration,
    pub minimum_backoff: Duration,
    pub maximum_backoff: Duration,
    /// Delete finished rows instead of stamping `finished_at`.
    pub destroy_finished_jobs: bool,
    /// Used for job classes that do not set their own.
    pub retry: RetryPolicy,
    pub middleware: Vec<Arc<dyn JobMiddleware>>,
    pub error_notifier: Arc<dyn ErrorNotifier>,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            worker_priorities: Vec::new(),
            queue_names: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_for_notifications: true,
            job_queue_capacity: DEFAULT_JOB_QUEUE_CAPACITY,
            wait_period: DEFAULT_WAIT_PERIOD,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            minimum_backoff: DEFAULT_MINIMUM_BACKOFF,
            maximum_backoff: DEFAULT_MAXIMUM_BACKOFF,
            destroy_finished_jobs: false,
            retry: RetryPolicy::default(),
            middleware: Vec::new(),
            error_notifier: Arc::new(TracingNotifier),
        }
    }
}

impl LockerConfig {
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    #[must_use]
    pub fn with_worker_priorities(mut self, priorities: Vec<Option<i16>>) -> Self {
        self.worker_priorities = priorities;
        self
    }

    #[must_use]
    pub fn with_queue_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue_names = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_wait_for_notifications(mut self, wait: bool) -> Self {
        self.wait_for_notifications = wait;
        self
    }

    #[must_use]
    pub fn with_job_queue_capacity(mut self, capacity: usize) -> Self {
        self.job_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_wait_period(mut self, period: Duration) -> Self {
        self.wait_period = period;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, minimum: Duration, maximum: Duration) -> Self {
        self.minimum_backoff = minimum;
        self.maximum_backoff = maximum;
        self
    }

    #[must_use]
    pub fn with_destroy_finished_jobs(mut self, destroy: bool) -> Self {
        self.destroy_finished_jobs = destroy;
        self
    }

    #[must_use]
    pub fn with_maximum_retry_count(mut self, count: i32) -> Self {
        self.retry.maximum_retry_count = count;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: RetryInterval) -> Self {
        self.retry.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn with_middleware<M: JobMiddleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    #[must_use]
    pub fn with_error_notifier<N: ErrorNotifier + 'static>(mut self, notifier: N) -> Self {
        self.error_notifier = Arc::new(notifier);
        self
    }

    /// Priority ceiling for each worker slot.
    pub fn worker_thresholds(&self) -> Vec<Option<i16>> {
        (0..self.worker_count)
            .map(|slot| self.worker_priorities.get(slot).copied().flatten())
            .collect()
    }

    /// The claim filter: configured queues, bounded by the loosest worker
    /// threshold.
    pub fn claim_filter(&self) -> ClaimFilter {
        let thresholds = self.worker_thresholds();
        let max_priority = if thresholds.iter().any(Option::is_none) {
            None
        } else {
            thresholds.into_iter().flatten().max()
        };
        ClaimFilter {
            queue_names: self.queue_names.clone(),
            max_priority,
        }
    }

    pub fn validate(&self) -> Result<(), JobQueueError> {
        let invalid = |msg: &str| Err(JobQueueError::InvalidConfig(msg.to_owned()));
        if self.worker_priorities.len() > self.worker_count {
            return invalid("more worker_priorities than workers");
        }
        if self.worker_count > 0 && self.job_queue_capacity == 0 {
            return invalid("job_queue_capacity must be at least 1");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be positive");
        }
        if self.wait_period.is_zero() {
            return invalid("wait_period must be positive");
        }
        if self.minimum_backoff > self.maximum_backoff {
            return invalid("minimum_backoff exceeds maximum_backoff");
        }
        if self.retry.maximum_retry_count < 0 {
            return invalid("maximum_retry_count must not be negative");
        }
        if self.queue_names.iter().any(|name| name.trim().is_empty()) {
            return invalid("queue names must not be empty");
        }
        Ok(())
    }
}

impl fmt::Debug for LockerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockerConfig")
            .field("worker_count", &self.worker_count)
            .field("worker_priorities", &self.worker_priorities)
            .field("queue_names", &self.queue_names)
            .field("poll_interval", &self.poll_interval)
            .field("wait_for_notifications", &self.wait_for_notifications)
            .field("job_queue_capacity", &self.job_queue_capacity)
            .field("wait_period", &self.wait_period)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("minimum_backoff", &self.minimum_backoff)
            .field("maximum_backoff", &self.maximum_backoff)
            .field("destroy_finished_jobs", &self.destroy_finished_jobs)
            .field("retry", &self.retry)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}
