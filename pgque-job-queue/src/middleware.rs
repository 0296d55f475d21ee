//! Middleware wrapped around every job execution.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::JobError;
use crate::types::JobRecord;

/// A boxed job execution, borrowed from the worker for the length of a run.
pub type JobFuture<'a> = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'a>>;

/// Identifying labels for a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLabels {
    pub id: i64,
    pub job_class: String,
    pub queue: String,
    pub priority: i16,
    pub error_count: i32,
}

impl From<&JobRecord> for JobLabels {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id,
            job_class: job.job_class.clone(),
            queue: job.queue.clone(),
            priority: job.priority,
            error_count: job.error_count,
        }
    }
}

/// Wraps job execution.
///
/// Implementations must await `next.run()` exactly once and should return
/// its result unchanged.
#[async_trait]
pub trait JobMiddleware: Send + Sync {
    async fn call(&self, labels: &JobLabels, next: Next<'_>) -> Result<(), JobError>;
}

/// The rest of the middleware chain plus the job itself.
pub struct Next<'a> {
    chain: &'a [Arc<dyn JobMiddleware>],
    labels: &'a JobLabels,
    endpoint: JobFuture<'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn JobMiddleware>],
        labels: &'a JobLabels,
        endpoint: JobFuture<'a>,
    ) -> Self {
        Self {
            chain,
            labels,
            endpoint,
        }
    }

    pub async fn run(self) -> Result<(), JobError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next::new(rest, self.labels, self.endpoint);
                head.call(self.labels, next).await
            }
            None => self.endpoint.await,
        }
    }
}

/// Logs how long each job took.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimingMiddleware;

#[async_trait]
impl JobMiddleware for TimingMiddleware {
    async fn call(&self, labels: &JobLabels, next: Next<'_>) -> Result<(), JobError> {
        let started = Instant::now();
        let result = next.run().await;
        tracing::info!(
            job_id = labels.id,
            job_class = %labels.job_class,
            queue = %labels.queue,
            priority = labels.priority,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "job ran"
        );
        result
    }
}
