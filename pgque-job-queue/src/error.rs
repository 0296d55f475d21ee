//! Error types for the job queue system.

use thiserror::Error;

/// Errors raised by the queue machinery itself: the store, the locker and
/// the resolution API.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("job store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("failed to encode job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    NotFound(i64),

    #[error("no job registered for class {0:?}")]
    UnknownJobClass(String),

    #[error("job {id} was already resolved ({resolution})")]
    AlreadyResolved { id: i64, resolution: &'static str },

    #[error("claim session is closed")]
    SessionClosed,

    #[error("locker has been stopped")]
    Stopped,

    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("invalid locker configuration: {0}")]
    InvalidConfig(String),

    #[error("job {job_class} failed: {source}")]
    JobFailed {
        job_class: String,
        #[source]
        source: Box<JobError>,
    },
}

impl JobQueueError {
    /// True for failures that mean the database session itself is unusable.
    pub fn is_session_failure(&self) -> bool {
        match self {
            Self::SessionClosed => true,
            Self::Store(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// The error a job handler returns.
///
/// `Failed` is counted against the job's retry budget. `Fatal` is not retried:
/// it propagates out of the worker slot, the row is left exactly as claimed and
/// its lock is released so another worker can pick it up.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Queue(#[from] JobQueueError),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Calling more than one resolution action from a single run.
    #[inline]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Queue(JobQueueError::AlreadyResolved { .. }))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(format!("invalid job arguments: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_and_contract_errors() {
        assert!(JobError::fatal("oom").is_fatal());
        assert!(!JobError::failed("flaky").is_fatal());

        let contract = JobError::from(JobQueueError::AlreadyResolved {
            id: 7,
            resolution: "finished",
        });
        assert!(contract.is_contract_violation());
        assert!(!contract.is_fatal());
        assert_eq!(contract.to_string(), "job 7 was already resolved (finished)");
    }

    #[test]
    fn session_failures() {
        assert!(JobQueueError::SessionClosed.is_session_failure());
        assert!(JobQueueError::Store(sqlx::Error::PoolClosed).is_session_failure());
        assert!(!JobQueueError::Store(sqlx::Error::RowNotFound).is_session_failure());
        assert!(!JobQueueError::NotFound(1).is_session_failure());
    }
}
