//! Producer-side client: enqueue jobs, or run them inline.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::context::JobContext;
use crate::error::{JobError, JobQueueError};
use crate::executor::JobRegistry;
use crate::middleware::{JobLabels, JobMiddleware};
use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::types::{
    EnqueueResult, JobClassStats, JobRecord, JobRequest, NewJob, Outcome, DEFAULT_PRIORITY,
    DEFAULT_QUEUE, MAX_TAGS, MAX_TAG_LENGTH, SCHEMA_VERSION,
};
use crate::worker::run_handler;

/// Ids handed to jobs that run synchronously and never reach the table.
static INLINE_JOB_IDS: AtomicI64 = AtomicI64::new(0);

/// Interface for enqueuing jobs.
#[derive(Clone)]
pub struct JobQueueClient {
    store: Arc<dyn JobStore>,
    registry: JobRegistry,
    run_synchronously: bool,
    retry: RetryPolicy,
    middleware: Vec<Arc<dyn JobMiddleware>>,
}

impl fmt::Debug for JobQueueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueueClient")
            .field("store", &"<dyn JobStore>")
            .field("registry", &self.registry)
            .field("run_synchronously", &self.run_synchronously)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

impl JobQueueClient {
    pub fn new(store: Arc<dyn JobStore>, registry: JobRegistry) -> Self {
        Self {
            store,
            registry,
            run_synchronously: false,
            retry: RetryPolicy::default(),
            middleware: Vec::new(),
        }
    }

    /// Run jobs inline on `enqueue` instead of inserting them.
    #[must_use]
    pub fn with_run_synchronously(mut self, run_synchronously: bool) -> Self {
        self.run_synchronously = run_synchronously;
        self
    }

    /// Retry policy for inline jobs whose class does not set one.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Middleware applied to inline jobs.
    #[must_use]
    pub fn with_middleware<M: JobMiddleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    #[inline]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    #[inline]
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    #[inline]
    pub fn runs_synchronously(&self) -> bool {
        self.run_synchronously
    }

    /// Insert a job and notify lockers, or run it inline in synchronous mode.
    ///
    /// In synchronous mode a failing job comes back as
    /// [`JobQueueError::JobFailed`] instead of being retried.
    pub async fn enqueue(&self, request: JobRequest) -> Result<EnqueueResult, JobQueueError> {
        let job = self.resolve(request)?;
        if self.run_synchronously {
            return self.run_inline(job).await;
        }
        let record = self.store.enqueue(job).await?;
        Ok(EnqueueResult::Enqueued(record))
    }

    /// Any row by id, regardless of state.
    pub async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError> {
        self.store.get_job(id).await
    }

    pub async fn job_stats(&self) -> Result<Vec<JobClassStats>, JobQueueError> {
        self.store.job_stats().await
    }

    /// Delete every job row.
    pub async fn clear(&self) -> Result<u64, JobQueueError> {
        self.store.clear().await
    }

    /// Validate a request and fill in its defaults.
    fn resolve(&self, request: JobRequest) -> Result<NewJob, JobQueueError> {
        if request.job_class.trim().is_empty() {
            return Err(JobQueueError::InvalidRequest(
                "job_class must not be empty".to_owned(),
            ));
        }
        validate_tags(&request.tags)?;

        let descriptor = self.registry.get(&request.job_class);
        let queue = request
            .queue
            .or_else(|| descriptor.and_then(|d| d.queue()).map(str::to_owned))
            .unwrap_or_else(|| DEFAULT_QUEUE.to_owned());
        let priority = request
            .priority
            .or_else(|| descriptor.and_then(|d| d.priority()))
            .unwrap_or(DEFAULT_PRIORITY);
        let data = if request.tags.is_empty() {
            json!({})
        } else {
            json!({ "tags": request.tags })
        };

        Ok(NewJob {
            queue,
            priority,
            run_at: request.run_at,
            job_class: request.job_class,
            args: request.args,
            kwargs: request.kwargs,
            data,
        })
    }

    async fn run_inline(&self, job: NewJob) -> Result<EnqueueResult, JobQueueError> {
        let descriptor = self
            .registry
            .get(&job.job_class)
            .cloned()
            .ok_or_else(|| JobQueueError::UnknownJobClass(job.job_class.clone()))?;

        let now = Utc::now();
        let run_at = job.run_at.unwrap_or(now);
        let record = JobRecord {
            id: INLINE_JOB_IDS.fetch_sub(1, Ordering::Relaxed) - 1,
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
        let labels = JobLabels::from(&record);
        let mut ctx = JobContext::new(record, None, descriptor.retry_policy(&self.retry), false);

        let failed = |source: JobError, job_class: &str| JobQueueError::JobFailed {
            job_class: job_class.to_owned(),
            source: Box::new(source),
        };

        run_handler(descriptor.handler(), &mut ctx, &labels, &self.middleware)
            .await
            .map_err(|err| failed(err, &labels.job_class))?;
        if !ctx.is_resolved() {
            ctx.default_resolve_action()
                .await
                .map_err(|err| failed(err, &labels.job_class))?;
        }

        let outcome = ctx.resolution().unwrap_or(Outcome::Finished);
        tracing::debug!(job_class = %labels.job_class, %outcome, "ran job inline");
        Ok(EnqueueResult::Ran {
            job: ctx.into_job(),
            outcome,
        })
    }
}

fn validate_tags(tags: &[String]) -> Result<(), JobQueueError> {
    if tags.len() > MAX_TAGS {
        return Err(JobQueueError::InvalidRequest(format!(
            "at most {MAX_TAGS} tags are allowed, got {}",
            tags.len()
        )));
    }
    if let Some(tag) = tags.iter().find(|tag| tag.chars().count() > MAX_TAG_LENGTH) {
        return Err(JobQueueError::InvalidRequest(format!(
            "tag {:?}... exceeds {MAX_TAG_LENGTH} characters",
            tag.chars().take(20).collect::<String>()
        )));
    }
    Ok(())
}
