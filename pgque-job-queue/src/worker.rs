//! Worker slots: pop a Metajob, run it, report the outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::context::JobContext;
use crate::error::{JobError, JobQueueError};
use crate::executor::JobHandler;
use crate::locker::Shared;
use crate::middleware::{JobFuture, JobLabels, JobMiddleware, Next};
use crate::notifier::{ErrorKind, ErrorNotifier, ErrorReport};
use crate::types::{JobResult, Metajob, Outcome};

/// Run `handler` through the middleware chain, turning panics into
/// recoverable failures.
pub(crate) async fn run_handler(
    handler: &Arc<dyn JobHandler>,
    ctx: &mut JobContext,
    labels: &JobLabels,
    middleware: &[Arc<dyn JobMiddleware>],
) -> Result<(), JobError> {
    let endpoint: JobFuture<'_> = handler.run(ctx);
    let next = Next::new(middleware, labels, endpoint);
    match AssertUnwindSafe(next.run()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(JobError::failed(format!(
            "job panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        return message;
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.as_str();
    }
    "non-string panic payload"
}

/// One slot of the worker pool.
pub(crate) struct Worker {
    index: usize,
    threshold: Option<i16>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        threshold: Option<i16>,
        shared: Arc<Shared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            threshold,
            shared,
            cancel,
        }
    }

    /// Work until cancelled. Returns the error that ended the slot, if any.
    pub(crate) async fn run(self) -> Result<(), JobError> {
        tracing::debug!(worker = self.index, threshold = ?self.threshold, "worker started");
        loop {
            let popped = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                popped = self.shared.job_queue.pop(self.threshold, self.shared.config.wait_period) => popped,
            };
            let Some(metajob) = popped else {
                continue;
            };

            self.shared.telemetry.worker_busy(self.index, metajob.id);
            let span = tracing::info_span!(
                "job",
                worker = self.index,
                job_id = metajob.id,
                queue = %metajob.queue,
                priority = metajob.priority
            );
            let result = self.work(&metajob).instrument(span).await;

            let outcome = match &result {
                Ok(outcome) => *outcome,
                Err((_, outcome)) => *outcome,
            };
            // Exactly one result per popped job, fatal or not.
            self.shared.result_queue.push(JobResult { metajob, outcome });
            self.shared.telemetry.worker_idle(self.index);

            if let Err((error, _)) = result {
                return Err(error);
            }
        }
        tracing::debug!(worker = self.index, "worker stopped");
        Ok(())
    }

    /// Load, run and resolve one job. A fatal error comes back with the
    /// outcome to report for the job.
    async fn work(&self, metajob: &Metajob) -> Result<Outcome, (JobError, Outcome)> {
        let shared = &self.shared;
        let notifier = shared.config.error_notifier.as_ref();

        // The claim read a snapshot: the row may have been finalized since.
        let job = match shared.store.load_job(metajob.id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!("job no longer eligible, releasing");
                return Ok(Outcome::Released);
            }
            Err(err) => {
                report_infrastructure(shared, notifier, &err);
                return Ok(Outcome::Released);
            }
        };

        let labels = JobLabels::from(&job);
        let descriptor = shared.registry.get(&job.job_class).cloned();
        let policy = match &descriptor {
            Some(descriptor) => descriptor.retry_policy(&shared.config.retry),
            None => shared.config.retry.clone(),
        };
        let mut ctx = JobContext::new(
            job,
            Some(Arc::clone(&shared.store)),
            policy,
            shared.config.destroy_finished_jobs,
        );

        let result = match &descriptor {
            Some(descriptor) => {
                run_handler(descriptor.handler(), &mut ctx, &labels, &shared.config.middleware).await
            }
            None => Err(JobQueueError::UnknownJobClass(labels.job_class.clone()).into()),
        };

        match result {
            Ok(()) if ctx.is_resolved() => {}
            Ok(()) => {
                if let Err(err) = ctx.default_resolve_action().await {
                    return Ok(self.unresolved(&labels, &err));
                }
            }
            Err(err) if err.is_fatal() => {
                let message = err.to_string();
                shared.telemetry.job_error(&labels.job_class, labels.id, &message);
                notifier.notify(&ErrorReport {
                    kind: ErrorKind::Fatal,
                    labels: Some(&labels),
                    message: &message,
                });
                let outcome = ctx.resolution().unwrap_or(Outcome::Released);
                return Err((err, outcome));
            }
            // Already resolved: report, but leave the resolution alone.
            Err(err) if err.is_contract_violation() || ctx.is_resolved() => {
                let message = err.to_string();
                shared.telemetry.job_error(&labels.job_class, labels.id, &message);
                let kind = if err.is_contract_violation() {
                    ErrorKind::Contract
                } else {
                    ErrorKind::Failed
                };
                notifier.notify(&ErrorReport {
                    kind,
                    labels: Some(&labels),
                    message: &message,
                });
            }
            Err(err) => {
                let message = err.to_string();
                shared.telemetry.job_error(&labels.job_class, labels.id, &message);
                match ctx.handle_error(&message).await {
                    Ok(outcome) => {
                        let kind = if outcome == Outcome::Expired {
                            ErrorKind::Expired
                        } else {
                            ErrorKind::Retried
                        };
                        notifier.notify(&ErrorReport {
                            kind,
                            labels: Some(&labels),
                            message: &message,
                        });
                    }
                    Err(resolve_err) => return Ok(self.unresolved(&labels, &resolve_err)),
                }
            }
        }

        Ok(ctx.resolution().unwrap_or(Outcome::Released))
    }

    /// The finalizing write failed: leave the row as claimed for a retry
    /// after its lock is released.
    fn unresolved(&self, labels: &JobLabels, err: &JobError) -> Outcome {
        tracing::warn!(
            job_id = labels.id,
            job_class = %labels.job_class,
            error = %err,
            "could not record job resolution, releasing"
        );
        self.shared.telemetry.infrastructure_error();
        self.shared.config.error_notifier.notify(&ErrorReport {
            kind: ErrorKind::Infrastructure,
            labels: Some(labels),
            message: &err.to_string(),
        });
        Outcome::Released
    }
}

fn report_infrastructure(shared: &Shared, notifier: &dyn ErrorNotifier, err: &JobQueueError) {
    shared.telemetry.infrastructure_error();
    let message = err.to_string();
    tracing::warn!(error = %message, "could not load claimed job, releasing");
    notifier.notify(&ErrorReport {
        kind: ErrorKind::Infrastructure,
        labels: None,
        message: &message,
    });
}
