//! The locker: claims jobs, feeds the worker pool and finalizes results.
//!
//! One control task owns a dedicated claim session. Every advisory lock this
//! locker holds lives on that session and is released by it once the job's
//! result comes back, after the worker's finalizing write has committed.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::LockerConfig;
use crate::error::{JobError, JobQueueError};
use crate::executor::JobRegistry;
use crate::job_queue::JobQueue;
use crate::notification::JobNotification;
use crate::notifier::{ErrorKind, ErrorReport};
use crate::result_queue::ResultQueue;
use crate::retry::FailureBackoff;
use crate::stats::{LockerSnapshot, Telemetry};
use crate::store::{ClaimFilter, ClaimSession, JobNotifications, JobStore};
use crate::types::{JobResult, Metajob, Outcome};
use crate::worker::Worker;

/// State shared by the control task and the workers.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) registry: JobRegistry,
    pub(crate) config: LockerConfig,
    pub(crate) job_queue: JobQueue,
    pub(crate) result_queue: ResultQueue,
    pub(crate) telemetry: Telemetry,
}

/// A running locker and its worker pool.
///
/// Dropping a `Locker` without calling [`stop`](Self::stop) cancels the
/// control task at its next wake-up; the claim session goes with it.
pub struct Locker {
    shared: Arc<Shared>,
    stop: CancellationToken,
    wake: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<Result<(), JobQueueError>>>>,
}

impl Locker {
    /// Validate `config`, start the worker pool and begin claiming.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        store: Arc<dyn JobStore>,
        registry: JobRegistry,
        config: LockerConfig,
    ) -> Result<Self, JobQueueError> {
        config.validate()?;
        let thresholds = config.worker_thresholds();
        let shared = Arc::new(Shared {
            store,
            registry,
            job_queue: JobQueue::new(config.job_queue_capacity),
            result_queue: ResultQueue::new(),
            telemetry: Telemetry::new(&thresholds),
            config,
        });
        let stop = CancellationToken::new();
        let wake = Arc::new(Notify::new());

        let control = ControlLoop::new(
            Arc::clone(&shared),
            thresholds,
            stop.clone(),
            Arc::clone(&wake),
        );
        let handle = tokio::spawn(control.run());

        tracing::info!(
            workers = shared.config.worker_count,
            queues = ?shared.config.queue_names,
            capacity = shared.config.job_queue_capacity,
            "locker started"
        );

        Ok(Self {
            shared,
            stop,
            wake,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask for a claim cycle now instead of at the next poll.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn snapshot(&self) -> LockerSnapshot {
        self.shared.telemetry.snapshot(self.shared.job_queue.len())
    }

    pub fn config(&self) -> &LockerConfig {
        &self.shared.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop claiming, let in-flight jobs finish (up to the shutdown timeout)
    /// and release the claim session.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), JobQueueError> {
        self.stop.cancel();
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return Err(JobQueueError::Stopped);
        };
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "locker task failed");
                Err(JobQueueError::Stopped)
            }
        };
        tracing::info!("locker stopped");
        result
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// What woke the control loop.
enum Event {
    Stop,
    Results,
    Wake,
    WorkerExited(Result<(usize, WorkerExit), JoinError>),
    Notification(Result<String, JobQueueError>),
    Timer,
}

/// How a worker task ended.
enum WorkerExit {
    Stopped,
    Fatal(JobError),
    Panicked,
}

/// Bookkeeping for one claimed job.
struct Claim {
    metajob: Metajob,
    /// Session generation the lock was taken on.
    generation: u64,
}

struct ControlLoop {
    shared: Arc<Shared>,
    thresholds: Vec<Option<i16>>,
    filter: ClaimFilter,
    stop: CancellationToken,
    wake: Arc<Notify>,
    worker_cancel: CancellationToken,
    workers: JoinSet<(usize, WorkerExit)>,
    session: Option<Box<dyn ClaimSession>>,
    generation: u64,
    notifications: Option<Box<dyn JobNotifications>>,
    claims: HashMap<i64, Claim>,
    claim_requested: bool,
    next_poll: Instant,
    scheduled_wake: Option<Instant>,
    claim_backoff: FailureBackoff,
    claim_retry_at: Option<Instant>,
    listen_backoff: FailureBackoff,
    listen_retry_at: Option<Instant>,
}

impl ControlLoop {
    fn new(
        shared: Arc<Shared>,
        thresholds: Vec<Option<i16>>,
        stop: CancellationToken,
        wake: Arc<Notify>,
    ) -> Self {
        let config = &shared.config;
        let filter = config.claim_filter();
        let claim_backoff = FailureBackoff::new(config.minimum_backoff, config.maximum_backoff);
        let listen_backoff = FailureBackoff::new(config.minimum_backoff, config.maximum_backoff);
        Self {
            thresholds,
            filter,
            stop,
            wake,
            worker_cancel: CancellationToken::new(),
            workers: JoinSet::new(),
            session: None,
            generation: 0,
            notifications: None,
            claims: HashMap::new(),
            claim_requested: true,
            next_poll: Instant::now(),
            scheduled_wake: None,
            claim_backoff,
            claim_retry_at: None,
            listen_backoff,
            listen_retry_at: None,
            shared,
        }
    }

    async fn run(mut self) -> Result<(), JobQueueError> {
        for index in 0..self.thresholds.len() {
            self.spawn_worker(index);
        }

        loop {
            self.drain_results().await;
            if self.stop.is_cancelled() {
                break;
            }
            self.ensure_subscription().await;
            if self.should_claim() {
                self.claim().await;
            }
            let event = self.next_event().await;
            self.handle_event(event).await;
        }

        self.shutdown().await
    }

    fn spawn_worker(&mut self, index: usize) {
        let worker = Worker::new(
            index,
            self.thresholds.get(index).copied().flatten(),
            Arc::clone(&self.shared),
            self.worker_cancel.clone(),
        );
        self.workers.spawn(async move {
            let exit = match AssertUnwindSafe(worker.run()).catch_unwind().await {
                Ok(Ok(())) => WorkerExit::Stopped,
                Ok(Err(err)) => WorkerExit::Fatal(err),
                Err(_) => WorkerExit::Panicked,
            };
            (index, exit)
        });
    }

    async fn next_event(&mut self) -> Event {
        let now = Instant::now();
        let can_claim = !self.thresholds.is_empty() && self.shared.job_queue.space() > 0;
        let claim_at = can_claim.then(|| match (self.claim_requested, self.claim_retry_at) {
            (true, retry_at) => retry_at.unwrap_or(now),
            (false, Some(retry_at)) => self.next_poll.max(retry_at),
            (false, None) => self.next_poll,
        });
        let listen_at = self.notifications.is_none().then_some(self.listen_retry_at).flatten();
        // A full queue waits on results, so the fallback timer is only a tick.
        let deadline = [claim_at, self.scheduled_wake, listen_at]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(now + self.shared.config.poll_interval);

        let has_workers = !self.workers.is_empty();
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Event::Stop,
            _ = self.shared.result_queue.wait() => Event::Results,
            Some(joined) = self.workers.join_next(), if has_workers => Event::WorkerExited(joined),
            _ = self.wake.notified() => Event::Wake,
            payload = next_notification(self.notifications.as_mut()) => Event::Notification(payload),
            _ = tokio::time::sleep_until(deadline) => Event::Timer,
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Stop | Event::Results => {}
            Event::Wake => self.claim_requested = true,
            Event::WorkerExited(joined) => self.worker_exited(joined).await,
            Event::Notification(Ok(payload)) => {
                self.listen_backoff.reset();
                self.notified(&payload);
            }
            Event::Notification(Err(err)) => {
                let delay = self.listen_backoff.next_delay();
                tracing::warn!(error = %err, ?delay, "notification subscription lost, polling until it returns");
                self.infrastructure_error(&err);
                self.notifications = None;
                self.listen_retry_at = Some(Instant::now() + delay);
            }
            Event::Timer => {
                let now = Instant::now();
                if self.scheduled_wake.is_some_and(|at| at <= now) {
                    self.scheduled_wake = None;
                    self.claim_requested = true;
                }
            }
        }
    }

    fn notified(&mut self, payload: &str) {
        let Some(notification) = JobNotification::parse(payload) else {
            self.claim_requested = true;
            return;
        };
        if !self.filter.accepts(&notification.queue, notification.priority) {
            return;
        }
        let now = Utc::now();
        if notification.run_at <= now {
            self.claim_requested = true;
            return;
        }
        let delay = (notification.run_at - now).to_std().unwrap_or_default();
        let Some(at) = Instant::now().checked_add(delay) else {
            return;
        };
        if self.scheduled_wake.map_or(true, |current| at < current) {
            tracing::debug!(job_id = notification.id, ?delay, "scheduled wake for future job");
            self.scheduled_wake = Some(at);
        }
    }

    fn should_claim(&self) -> bool {
        if self.thresholds.is_empty() || self.shared.job_queue.space() == 0 {
            return false;
        }
        let now = Instant::now();
        if self.claim_retry_at.is_some_and(|at| now < at) {
            return false;
        }
        self.claim_requested || now >= self.next_poll
    }

    async fn claim(&mut self) {
        let space = self.shared.job_queue.space();
        let held: Vec<i64> = self.claims.keys().copied().collect();

        let mut session = match self.session.take() {
            Some(session) => session,
            None => match self.shared.store.claim_session().await {
                Ok(session) => {
                    self.generation += 1;
                    tracing::debug!(generation = self.generation, "claim session opened");
                    session
                }
                Err(err) => {
                    self.claim_failed(&err);
                    return;
                }
            },
        };

        match session.claim(&self.filter, &held, space).await {
            Ok(claimed) => {
                self.session = Some(session);
                self.claim_backoff.reset();
                self.claim_retry_at = None;
                self.next_poll = Instant::now() + self.shared.config.poll_interval;
                // A full batch suggests more is waiting.
                self.claim_requested = claimed.len() >= space;

                if !claimed.is_empty() {
                    tracing::debug!(count = claimed.len(), "claimed jobs");
                }
                for metajob in claimed {
                    self.accept(metajob).await;
                }
            }
            Err(err) => {
                if err.is_session_failure() {
                    // Closing the broken session drops whatever it held.
                    drop(session);
                    self.session_lost();
                } else {
                    self.session = Some(session);
                }
                self.claim_failed(&err);
            }
        }
    }

    async fn accept(&mut self, metajob: Metajob) {
        self.shared.telemetry.claimed(&metajob);
        self.claims.insert(
            metajob.id,
            Claim {
                metajob: metajob.clone(),
                generation: self.generation,
            },
        );
        if let Err(metajob) = self.shared.job_queue.push(metajob) {
            // Only this task pushes, so space was checked above; hand it back.
            self.release(metajob.id, Outcome::Released).await;
        }
    }

    fn claim_failed(&mut self, err: &JobQueueError) {
        let delay = self.claim_backoff.next_delay();
        tracing::warn!(error = %err, ?delay, "claim failed, backing off");
        self.infrastructure_error(err);
        self.claim_retry_at = Some(Instant::now() + delay);
        self.claim_requested = true;
    }

    /// The claim session is gone, and with it every lock it held. Queued jobs
    /// that have not started are dropped. Running ones finish but no longer
    /// need unlocking.
    fn session_lost(&mut self) {
        self.session = None;
        for metajob in self.shared.job_queue.clear() {
            if let Some(claim) = self.claims.remove(&metajob.id) {
                self.shared.telemetry.settled(&claim.metajob, Outcome::Released);
            }
        }
    }

    async fn ensure_subscription(&mut self) {
        if !self.shared.config.wait_for_notifications || self.notifications.is_some() {
            return;
        }
        if self.listen_retry_at.is_some_and(|at| Instant::now() < at) {
            return;
        }
        match self.shared.store.listen().await {
            Ok(notifications) => {
                self.notifications = Some(notifications);
                self.listen_retry_at = None;
                // Anything published while we were away was missed. The
                // backoff is only reset once a notification arrives.
                if self.listen_backoff.is_failing() {
                    self.claim_requested = true;
                }
            }
            Err(err) => {
                let delay = self.listen_backoff.next_delay();
                tracing::warn!(error = %err, ?delay, "could not subscribe to notifications");
                self.infrastructure_error(&err);
                self.listen_retry_at = Some(Instant::now() + delay);
            }
        }
    }

    async fn drain_results(&mut self) {
        for JobResult { metajob, outcome } in self.shared.result_queue.drain() {
            tracing::debug!(job_id = metajob.id, %outcome, "job result");
            self.release(metajob.id, outcome).await;
        }
    }

    /// Forget a claim and release its advisory lock.
    async fn release(&mut self, id: i64, outcome: Outcome) {
        let Some(claim) = self.claims.remove(&id) else {
            return;
        };
        self.shared.telemetry.settled(&claim.metajob, outcome);
        if claim.generation != self.generation {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.unlock(id).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(job_id = id, "advisory lock was not held"),
            // Even on a live session the lock may still be held; only closing
            // the session is sure to release it.
            Err(err) => {
                tracing::warn!(
                    job_id = id,
                    error = %err,
                    session_failure = err.is_session_failure(),
                    "unlock failed, dropping claim session"
                );
                self.infrastructure_error(&err);
                self.session_lost();
            }
        }
    }

    async fn worker_exited(&mut self, joined: Result<(usize, WorkerExit), JoinError>) {
        let (index, exit) = match joined {
            Ok(exit) => exit,
            Err(err) => {
                tracing::error!(error = %err, "worker task aborted");
                return;
            }
        };
        match exit {
            WorkerExit::Stopped => return,
            // The worker already reported the job error.
            WorkerExit::Fatal(err) => {
                tracing::error!(worker = index, error = %err, "worker slot ended with a fatal error");
            }
            WorkerExit::Panicked => {
                tracing::error!(worker = index, "worker panicked outside a job");
                self.shared.config.error_notifier.notify(&ErrorReport {
                    kind: ErrorKind::Fatal,
                    labels: None,
                    message: "worker panicked",
                });
            }
        }
        self.shared.telemetry.worker_restarted();

        // The worker pushed its result before exiting unless it panicked
        // outside a job; either way settle whatever that slot held.
        self.drain_results().await;
        if let Some(job_id) = self.shared.telemetry.current_job(index) {
            self.shared.telemetry.worker_idle(index);
            self.release(job_id, Outcome::Released).await;
        }

        if !self.stop.is_cancelled() {
            tracing::info!(worker = index, "restarting worker");
            self.spawn_worker(index);
        }
    }

    fn infrastructure_error(&self, err: &JobQueueError) {
        self.shared.telemetry.infrastructure_error();
        self.shared.config.error_notifier.notify(&ErrorReport {
            kind: ErrorKind::Infrastructure,
            labels: None,
            message: &err.to_string(),
        });
    }

    #[instrument(skip(self))]
    async fn shutdown(mut self) -> Result<(), JobQueueError> {
        // Jobs nobody started yet go back to the table immediately.
        for metajob in self.shared.job_queue.clear() {
            self.release(metajob.id, Outcome::Released).await;
        }
        self.worker_cancel.cancel();

        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        while !self.workers.is_empty() {
            let timed_out = tokio::select! {
                joined = self.workers.join_next() => {
                    if let Some(Ok((index, WorkerExit::Fatal(err)))) = joined {
                        tracing::warn!(worker = index, error = %err, "worker failed during shutdown");
                    }
                    false
                }
                _ = self.shared.result_queue.wait() => false,
                _ = tokio::time::sleep_until(deadline) => true,
            };
            if timed_out {
                tracing::warn!(
                    remaining = self.workers.len(),
                    "shutdown timeout reached, aborting workers"
                );
                self.workers.abort_all();
                while self.workers.join_next().await.is_some() {}
            }
            self.drain_results().await;
        }
        self.drain_results().await;

        // Whatever is still tracked belonged to aborted workers.
        let leftover: Vec<i64> = self.claims.keys().copied().collect();
        for id in leftover {
            self.release(id, Outcome::Released).await;
        }

        self.notifications = None;
        if let Some(mut session) = self.session.take() {
            let unlocked = session.unlock_all().await;
            let closed = session.close().await;
            unlocked?;
            closed?;
        }
        Ok(())
    }
}

async fn next_notification(
    notifications: Option<&mut Box<dyn JobNotifications>>,
) -> Result<String, JobQueueError> {
    match notifications {
        Some(notifications) => notifications.recv().await,
        None => std::future::pending().await,
    }
}
