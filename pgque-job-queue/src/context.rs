//! The resolution API handed to running job code.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{JobError, JobQueueError};
use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::types::{truncate_error, JobRecord, Outcome};

/// A claimed job plus the operations that resolve it.
///
/// Exactly one of [`finish`](Self::finish), [`retry_in`](Self::retry_in),
/// [`expire`](Self::expire) or [`destroy`](Self::destroy) may succeed per
/// run; a second call fails with [`JobQueueError::AlreadyResolved`].
pub struct JobContext {
    job: JobRecord,
    /// `None` in synchronous mode: resolutions are only recorded in memory.
    store: Option<Arc<dyn JobStore>>,
    retry: RetryPolicy,
    destroy_finished: bool,
    resolution: Option<Outcome>,
}

impl JobContext {
    pub(crate) fn new(
        job: JobRecord,
        store: Option<Arc<dyn JobStore>>,
        retry: RetryPolicy,
        destroy_finished: bool,
    ) -> Self {
        Self {
            job,
            store,
            retry,
            destroy_finished,
            resolution: None,
        }
    }

    #[inline]
    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    #[inline]
    pub fn id(&self) -> i64 {
        self.job.id
    }

    #[inline]
    pub fn args(&self) -> &[Value] {
        &self.job.args
    }

    #[inline]
    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.job.kwargs
    }

    /// Deserialize positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, JobError> {
        let value = self
            .job
            .args
            .get(index)
            .ok_or_else(|| JobError::failed(format!("missing positional argument {index}")))?;
        Ok(T::deserialize(value)?)
    }

    /// Deserialize keyword argument `name`.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, JobError> {
        let value = self
            .job
            .kwargs
            .get(name)
            .ok_or_else(|| JobError::failed(format!("missing keyword argument {name:?}")))?;
        Ok(T::deserialize(value)?)
    }

    /// Failures recorded before this run.
    #[inline]
    pub fn error_count(&self) -> i32 {
        self.job.error_count
    }

    #[inline]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The action taken so far, if any.
    #[inline]
    pub fn resolution(&self) -> Option<Outcome> {
        self.resolution
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Mark the job finished (or delete it when the locker is configured to
    /// destroy finished jobs).
    pub async fn finish(&mut self) -> Result<(), JobError> {
        self.ensure_unresolved()?;
        if self.destroy_finished {
            if let Some(store) = &self.store {
                store.destroy_job(self.job.id).await?;
            }
        } else if let Some(store) = &self.store {
            store.finish_job(self.job.id).await?;
        }
        self.job.finished_at = Some(Utc::now());
        self.resolution = Some(Outcome::Finished);
        Ok(())
    }

    /// Reschedule `interval` from now, counting this run as a failure. Expires
    /// the job instead once the retry budget is spent.
    pub async fn retry_in(&mut self, interval: Duration) -> Result<(), JobError> {
        self.reschedule(interval, None).await.map(|_| ())
    }

    /// Give up on the job permanently.
    pub async fn expire(&mut self) -> Result<(), JobError> {
        self.ensure_unresolved()?;
        if let Some(store) = &self.store {
            store.expire_job(self.job.id, None).await?;
        }
        self.job.expired_at = Some(Utc::now());
        self.resolution = Some(Outcome::Expired);
        Ok(())
    }

    /// Delete the row.
    pub async fn destroy(&mut self) -> Result<(), JobError> {
        self.ensure_unresolved()?;
        if let Some(store) = &self.store {
            store.destroy_job(self.job.id).await?;
        }
        self.resolution = Some(Outcome::Destroyed);
        Ok(())
    }

    /// Applied when job code returned without resolving.
    pub async fn default_resolve_action(&mut self) -> Result<(), JobError> {
        self.finish().await
    }

    /// Record a failed run: reschedule with the policy's backoff, or expire
    /// when the budget is spent.
    pub(crate) async fn handle_error(&mut self, message: &str) -> Result<Outcome, JobError> {
        let interval = self
            .retry
            .retry_interval
            .interval_for(self.job.error_count.saturating_add(1));
        self.reschedule(interval, Some(message)).await
    }

    async fn reschedule(
        &mut self,
        interval: Duration,
        error: Option<&str>,
    ) -> Result<Outcome, JobError> {
        self.ensure_unresolved()?;
        let error = error.map(truncate_error);
        let error_count = self.job.error_count.saturating_add(1);
        let outcome = if self.retry.is_exhausted(error_count) {
            if let Some(store) = &self.store {
                // An explicit error marks the expiry as a failure.
                let reason = error.as_deref().unwrap_or("retry budget exhausted");
                store.expire_job(self.job.id, Some(reason)).await?;
            }
            self.job.expired_at = Some(Utc::now());
            Outcome::Expired
        } else {
            if let Some(store) = &self.store {
                store.retry_job(self.job.id, interval, error.as_deref()).await?;
            }
            self.job.run_at = chrono::Duration::from_std(interval)
                .ok()
                .and_then(|offset| Utc::now().checked_add_signed(offset))
                .unwrap_or(self.job.run_at);
            Outcome::Retried
        };

        self.job.error_count = error_count;
        if error.is_some() {
            self.job.last_error = error;
        }
        self.resolution = Some(outcome);
        Ok(outcome)
    }

    fn ensure_unresolved(&self) -> Result<(), JobQueueError> {
        match self.resolution {
            Some(outcome) => Err(JobQueueError::AlreadyResolved {
                id: self.job.id,
                resolution: outcome.as_str(),
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn into_job(self) -> JobRecord {
        self.job
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job)
            .field("persistent", &self.store.is_some())
            .field("retry", &self.retry)
            .field("destroy_finished", &self.destroy_finished)
            .field("resolution", &self.resolution)
            .finish()
    }
}
