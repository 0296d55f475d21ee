//! Durable job queue on PostgreSQL advisory locks.
//!
//! Producers insert rows through a [`JobQueueClient`]. Each [`Locker`] claims
//! eligible rows by taking a session-scoped advisory lock on the job id,
//! buffers their [`Metajob`]s in a bounded [`JobQueue`], and runs them on a
//! pool of workers. Outcomes come back through the [`ResultQueue`] and the
//! locker releases each lock only after the job's final write. If a locker's
//! session dies, PostgreSQL drops its locks and the jobs become claimable
//! again.
//!
//! # Architecture
//!
//! - [`JobQueueClient`] - Enqueue jobs, or run them inline in synchronous mode
//! - [`Locker`] - Claim loop, worker pool and result finalization
//! - [`JobHandler`] / [`JobRegistry`] - Job behavior, looked up by class name
//! - [`JobContext`] - The resolution API: finish, retry_in, expire, destroy
//! - [`JobStore`] - Persistence, locks and notifications ([`PgJobStore`],
//!   [`MemoryStore`])
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pgque_job_queue::{
//!     async_trait, JobContext, JobDescriptor, JobError, JobHandler, JobQueueClient,
//!     JobRegistry, JobRequest, Locker, LockerConfig, MemoryStore,
//! };
//! use serde_json::json;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
//!         let to: String = ctx.arg(0)?;
//!         println!("sending to {to}");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let registry = JobRegistry::new().with(JobDescriptor::new("send_email", SendEmail));
//!
//!     let client = JobQueueClient::new(store.clone(), registry.clone());
//!     client
//!         .enqueue(JobRequest::new("send_email").with_args(vec![json!("ops@example.com")]))
//!         .await?;
//!
//!     let locker = Locker::start(store, registry, LockerConfig::default())?;
//!     locker.stop().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod context;
mod error;
mod executor;
mod job_queue;
mod locker;
mod middleware;
mod notification;
mod notifier;
mod result_queue;
mod retry;
mod stats;
mod store;
mod types;
mod worker;

pub use client::JobQueueClient;
pub use config::{
    LockerConfig, DEFAULT_JOB_QUEUE_CAPACITY, DEFAULT_MAXIMUM_BACKOFF, DEFAULT_MINIMUM_BACKOFF,
    DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_WAIT_PERIOD, DEFAULT_WORKER_COUNT,
};
pub use context::JobContext;
pub use error::{JobError, JobQueueError};
pub use executor::{JobDescriptor, JobHandler, JobRegistry, NoOpJob};
pub use job_queue::JobQueue;
pub use locker::Locker;
pub use middleware::{JobFuture, JobLabels, JobMiddleware, Next, TimingMiddleware};
pub use notification::{JobNotification, MAX_PAYLOAD_BYTES, NOTIFICATION_CHANNEL, POLL_SENTINEL};
pub use notifier::{ErrorKind, ErrorNotifier, ErrorReport, TracingNotifier};
pub use result_queue::ResultQueue;
pub use retry::{RetryInterval, RetryPolicy, DEFAULT_MAXIMUM_RETRY_COUNT};
pub use stats::{InFlightBucket, LastError, LockerCounters, LockerSnapshot, WorkerSnapshot};
pub use store::{
    ClaimFilter, ClaimSession, JobNotifications, JobStore, MemoryStore, PgJobStore, JOBS_TABLE,
};
pub use types::{
    truncate_error, EnqueueResult, JobClassStats, JobRecord, JobRequest, JobResult, JobStatus,
    Metajob, NewJob, Outcome, DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_ERROR_LENGTH, MAX_TAGS,
    MAX_TAG_LENGTH, SCHEMA_VERSION,
};

// Re-export async_trait for convenience when implementing JobHandler
pub use async_trait::async_trait;
