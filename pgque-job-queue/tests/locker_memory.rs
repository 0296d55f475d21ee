//! Locker behaviour against the in-memory store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pgque_job_queue::{
    async_trait, ClaimFilter, ClaimSession, ErrorKind, ErrorNotifier, ErrorReport, JobClassStats,
    JobContext, JobDescriptor, JobError, JobHandler, JobLabels, JobMiddleware, JobNotifications,
    JobQueueClient, JobQueueError, JobRecord, JobRegistry, JobRequest, JobStore, Locker,
    LockerConfig, MemoryStore, NewJob, Next, RetryInterval,
};
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

/// Records `(id, priority)` of every run, then returns without resolving.
#[derive(Clone, Default)]
struct Recorder {
    runs: Arc<Mutex<Vec<(i64, i16)>>>,
}

impl Recorder {
    fn ids(&self) -> Vec<i64> {
        self.runs.lock().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl JobHandler for Recorder {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        self.runs.lock().push((ctx.id(), ctx.job().priority));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct AlwaysFails {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn run(&self, _ctx: &mut JobContext) -> Result<(), JobError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(JobError::failed("smtp timeout"))
    }
}

/// Fatal on its first run, fine afterwards.
#[derive(Clone, Default)]
struct FatalOnce {
    tripped: Arc<AtomicBool>,
}

#[async_trait]
impl JobHandler for FatalOnce {
    async fn run(&self, _ctx: &mut JobContext) -> Result<(), JobError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(JobError::fatal("out of file descriptors"));
        }
        Ok(())
    }
}

struct Panics;

#[async_trait]
impl JobHandler for Panics {
    async fn run(&self, _ctx: &mut JobContext) -> Result<(), JobError> {
        panic!("boom");
    }
}

/// Signals when it starts, then waits to be released.
#[derive(Clone, Default)]
struct Gate {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl JobHandler for Gate {
    async fn run(&self, _ctx: &mut JobContext) -> Result<(), JobError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Counting {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JobMiddleware for Counting {
    async fn call(&self, _labels: &JobLabels, next: Next<'_>) -> Result<(), JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        next.run().await
    }
}

/// Finishes the job, then reports an error anyway.
struct FinishThenFail;

#[async_trait]
impl JobHandler for FinishThenFail {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        ctx.finish().await?;
        Err(JobError::failed("post-commit hook failed"))
    }
}

/// Keeps the kind of every report it sees.
#[derive(Clone, Default)]
struct RecordingNotifier {
    kinds: Arc<Mutex<Vec<ErrorKind>>>,
}

impl ErrorNotifier for RecordingNotifier {
    fn notify(&self, report: &ErrorReport<'_>) {
        self.kinds.lock().push(report.kind);
    }
}

/// A store whose notification subscriptions die as soon as they are read.
#[derive(Clone)]
struct DroppingSubscriptions {
    inner: MemoryStore,
    listens: Arc<AtomicUsize>,
}

struct DeadSubscription;

#[async_trait]
impl JobNotifications for DeadSubscription {
    async fn recv(&mut self) -> Result<String, JobQueueError> {
        Err(JobQueueError::SessionClosed)
    }
}

#[async_trait]
impl JobStore for DroppingSubscriptions {
    async fn now(&self) -> Result<DateTime<Utc>, JobQueueError> {
        self.inner.now().await
    }

    async fn enqueue(&self, job: NewJob) -> Result<JobRecord, JobQueueError> {
        self.inner.enqueue(job).await
    }

    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError> {
        self.inner.get_job(id).await
    }

    async fn load_job(&self, id: i64) -> Result<Option<JobRecord>, JobQueueError> {
        self.inner.load_job(id).await
    }

    async fn finish_job(&self, id: i64) -> Result<(), JobQueueError> {
        self.inner.finish_job(id).await
    }

    async fn retry_job(
        &self,
        id: i64,
        interval: Duration,
        error: Option<&str>,
    ) -> Result<(), JobQueueError> {
        self.inner.retry_job(id, interval, error).await
    }

    async fn expire_job(&self, id: i64, error: Option<&str>) -> Result<(), JobQueueError> {
        self.inner.expire_job(id, error).await
    }

    async fn destroy_job(&self, id: i64) -> Result<(), JobQueueError> {
        self.inner.destroy_job(id).await
    }

    async fn claim_session(&self) -> Result<Box<dyn ClaimSession>, JobQueueError> {
        self.inner.claim_session().await
    }

    async fn listen(&self) -> Result<Box<dyn JobNotifications>, JobQueueError> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(DeadSubscription))
    }

    async fn job_stats(&self) -> Result<Vec<JobClassStats>, JobQueueError> {
        self.inner.job_stats().await
    }

    async fn clear(&self) -> Result<u64, JobQueueError> {
        self.inner.clear().await
    }
}

fn fast_config() -> LockerConfig {
    LockerConfig::default()
        .with_worker_count(1)
        .with_poll_interval(Duration::from_millis(20))
        .with_wait_period(Duration::from_millis(10))
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .with_shutdown_timeout(Duration::from_secs(5))
}

fn client(store: &MemoryStore, registry: &JobRegistry) -> JobQueueClient {
    JobQueueClient::new(Arc::new(store.clone()), registry.clone())
}

async fn enqueue(client: &JobQueueClient, request: JobRequest) -> JobRecord {
    client.enqueue(request).await.unwrap().job().clone()
}

/// Poll the store until `done` holds for the row.
async fn wait_for<F>(store: &MemoryStore, id: i64, done: F) -> Option<JobRecord>
where
    F: Fn(Option<&JobRecord>) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let job = store.get_job(id).await.unwrap();
            if done(job.as_ref()) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for job")
}

fn finished(job: Option<&JobRecord>) -> bool {
    job.is_some_and(|job| job.finished_at.is_some())
}

fn expired(job: Option<&JobRecord>) -> bool {
    job.is_some_and(|job| job.expired_at.is_some())
}

#[tokio::test]
async fn runs_best_priority_first() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);

    let a = enqueue(&client, JobRequest::new("record").with_priority(5)).await;
    let b = enqueue(&client, JobRequest::new("record").with_priority(1)).await;
    let c = enqueue(&client, JobRequest::new("record").with_priority(5)).await;

    let locker = Locker::start(Arc::new(store.clone()), registry, fast_config()).unwrap();
    for job in [&a, &b, &c] {
        wait_for(&store, job.id, finished).await;
    }
    locker.stop().await.unwrap();

    assert_eq!(recorder.ids(), vec![b.id, a.id, c.id]);
    for job in [&a, &b, &c] {
        assert!(!store.is_locked(job.id));
    }
    assert_eq!(locker.snapshot().counters.finished, 3);
}

#[tokio::test]
async fn future_jobs_wait_for_run_at() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);

    let run_at = store.now().await.unwrap() + chrono::Duration::seconds(60);
    let job = enqueue(&client, JobRequest::new("record").with_run_at(run_at)).await;

    let locker = Locker::start(Arc::new(store.clone()), registry, fast_config()).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(recorder.ids().is_empty());

    store.advance(Duration::from_secs(61));
    wait_for(&store, job.id, finished).await;
    locker.stop().await.unwrap();
    assert_eq!(recorder.ids(), vec![job.id]);
}

#[tokio::test]
async fn jobs_locked_elsewhere_are_skipped_until_the_holder_goes_away() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);
    let job = enqueue(&client, JobRequest::new("record")).await;

    // A locker that claimed the job and then died without finishing it.
    let mut crashed = store.claim_session().await.unwrap();
    let held = crashed.claim(&ClaimFilter::default(), &[], 1).await.unwrap();
    assert_eq!(held.len(), 1);

    let locker = Locker::start(Arc::new(store.clone()), registry, fast_config()).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(recorder.ids().is_empty());

    drop(crashed);
    wait_for(&store, job.id, finished).await;
    locker.stop().await.unwrap();
    assert_eq!(recorder.ids(), vec![job.id]);
}

#[tokio::test]
async fn failures_retry_until_the_budget_is_spent() {
    let store = MemoryStore::new();
    let handler = AlwaysFails::default();
    let registry = JobRegistry::new().with(
        JobDescriptor::new("mailer", handler.clone())
            .with_maximum_retry_count(2)
            .with_retry_interval(RetryInterval::fixed(Duration::ZERO)),
    );
    let client = client(&store, &registry);
    let job = enqueue(&client, JobRequest::new("mailer")).await;

    let locker = Locker::start(Arc::new(store.clone()), registry, fast_config()).unwrap();
    let done = wait_for(&store, job.id, expired).await.unwrap();
    locker.stop().await.unwrap();

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(done.error_count, 3);
    assert_eq!(done.last_error.as_deref(), Some("smtp timeout"));
    assert!(done.finished_at.is_none());

    let counters = locker.snapshot().counters;
    assert_eq!(counters.retried, 2);
    assert_eq!(counters.expired, 1);
}

#[tokio::test]
async fn fatal_errors_restart_the_worker_and_release_the_job() {
    let store = MemoryStore::new();
    let handler = FatalOnce::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("flaky", handler.clone()));
    let client = client(&store, &registry);
    let job = enqueue(&client, JobRequest::new("flaky")).await;

    let locker = Locker::start(Arc::new(store.clone()), registry, fast_config()).unwrap();
    let done = wait_for(&store, job.id, finished).await.unwrap();
    locker.stop().await.unwrap();

    // The fatal run left the row untouched.
    assert_eq!(done.error_count, 0);
    assert!(handler.tripped.load(Ordering::SeqCst));

    let snapshot = locker.snapshot();
    assert_eq!(snapshot.counters.worker_restarts, 1);
    assert_eq!(snapshot.counters.released, 1);
    assert_eq!(snapshot.counters.finished, 1);
    assert_eq!(snapshot.last_errors.len(), 1);
}

#[tokio::test]
async fn panics_are_recorded_as_failures() {
    let store = MemoryStore::new();
    let registry = JobRegistry::new()
        .with(JobDescriptor::new("panics", Panics).with_maximum_retry_count(0));
    let client = client(&store, &registry);
    let job = enqueue(&client, JobRequest::new("panics")).await;

    let locker = Locker::start(Arc::new(store.clone()), registry, fast_config()).unwrap();
    let done = wait_for(&store, job.id, expired).await.unwrap();
    locker.stop().await.unwrap();

    assert_eq!(done.error_count, 1);
    assert_eq!(done.last_error.as_deref(), Some("job panicked: boom"));
    assert_eq!(locker.snapshot().counters.worker_restarts, 0);
}

#[tokio::test]
async fn stop_releases_queued_jobs_and_waits_for_running_ones() {
    let store = MemoryStore::new();
    let gate = Gate::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("gate", gate.clone()));
    let client = client(&store, &registry);
    let first = enqueue(&client, JobRequest::new("gate")).await;
    let second = enqueue(&client, JobRequest::new("gate")).await;

    let locker = Locker::start(Arc::new(store.clone()), registry, fast_config()).unwrap();
    tokio::time::timeout(WAIT, gate.started.notified())
        .await
        .unwrap();

    let snapshot = locker.snapshot();
    assert_eq!(snapshot.busy_workers(), 1);
    assert_eq!(snapshot.queued, 1);
    assert_eq!(snapshot.in_flight_total(), 2);
    assert!(store.is_locked(second.id));

    let stopping = tokio::spawn(async move { locker.stop().await });
    tokio::time::timeout(WAIT, async {
        while store.is_locked(second.id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(store.is_locked(first.id));

    gate.release.notify_one();
    stopping.await.unwrap().unwrap();

    let first = store.get_job(first.id).await.unwrap().unwrap();
    let second = store.get_job(second.id).await.unwrap().unwrap();
    assert!(first.finished_at.is_some());
    assert!(second.finished_at.is_none());
    assert!(!store.is_locked(first.id));
    assert!(!store.is_locked(second.id));
}

#[tokio::test]
async fn stop_can_only_be_called_once() {
    let store = MemoryStore::new();
    let locker = Locker::start(
        Arc::new(store),
        JobRegistry::new(),
        fast_config().with_worker_count(0),
    )
    .unwrap();
    locker.stop().await.unwrap();
    assert!(locker.is_stopped());
    assert!(matches!(locker.stop().await, Err(JobQueueError::Stopped)));
}

#[tokio::test]
async fn notifications_wake_an_idle_locker() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);

    let config = fast_config().with_poll_interval(Duration::from_secs(60));
    let locker = Locker::start(Arc::new(store.clone()), registry, config).unwrap();
    // Let the locker subscribe and finish its first empty claim.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = enqueue(&client, JobRequest::new("record")).await;
    wait_for(&store, job.id, finished).await;
    locker.stop().await.unwrap();
    assert_eq!(recorder.ids(), vec![job.id]);
}

#[tokio::test]
async fn claim_failures_back_off_and_recover() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);
    let job = enqueue(&client, JobRequest::new("record")).await;

    store.fail_next_claims(2);
    let locker = Locker::start(Arc::new(store.clone()), registry, fast_config()).unwrap();
    wait_for(&store, job.id, finished).await;
    locker.stop().await.unwrap();

    assert!(locker.snapshot().counters.infrastructure_errors >= 2);
    assert_eq!(recorder.ids(), vec![job.id]);
}

#[tokio::test]
async fn dropped_subscriptions_resubscribe_with_backoff() {
    let store = MemoryStore::new();
    let listens = Arc::new(AtomicUsize::new(0));
    let dropping = DroppingSubscriptions {
        inner: store.clone(),
        listens: listens.clone(),
    };
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);

    // Retries at roughly 50, 150 and 350ms; an unthrottled loop would
    // resubscribe thousands of times.
    let config = fast_config()
        .with_poll_interval(Duration::from_secs(60))
        .with_backoff(Duration::from_millis(50), Duration::from_millis(200));
    let locker = Locker::start(Arc::new(dropping), registry, config).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let count = listens.load(Ordering::SeqCst);
    assert!((2..=5).contains(&count), "{count} subscriptions");

    // The notification is lost, but the next resubscribe claims anyway.
    let started = Instant::now();
    let job = enqueue(&client, JobRequest::new("record")).await;
    wait_for(&store, job.id, finished).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    locker.stop().await.unwrap();

    assert_eq!(recorder.ids(), vec![job.id]);
    assert!(locker.snapshot().counters.infrastructure_errors >= 2);
}

#[tokio::test]
async fn rejected_claims_keep_the_session_and_its_locks() {
    let store = MemoryStore::new();
    let gate = Gate::default();
    let recorder = Recorder::default();
    let registry = JobRegistry::new()
        .with(JobDescriptor::new("gate", gate.clone()))
        .with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);
    let running = enqueue(&client, JobRequest::new("gate")).await;

    let config = fast_config().with_worker_count(2);
    let locker = Locker::start(Arc::new(store.clone()), registry, config).unwrap();
    tokio::time::timeout(WAIT, gate.started.notified())
        .await
        .expect("gate job never started");

    store.reject_next_claims(3);
    tokio::time::timeout(WAIT, async {
        while locker.snapshot().counters.infrastructure_errors < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("claims were not retried");
    assert!(store.is_locked(running.id));
    assert_eq!(store.sessions_opened(), 1);

    let queued = enqueue(&client, JobRequest::new("record")).await;
    wait_for(&store, queued.id, finished).await;
    gate.release.notify_one();
    wait_for(&store, running.id, finished).await;
    locker.stop().await.unwrap();

    assert_eq!(recorder.ids(), vec![queued.id]);
    assert_eq!(store.sessions_opened(), 1);
}

#[tokio::test]
async fn errors_after_resolving_are_reported_as_failures() {
    let store = MemoryStore::new();
    let notifier = RecordingNotifier::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("finish_then_fail", FinishThenFail));
    let client = client(&store, &registry);
    let job = enqueue(&client, JobRequest::new("finish_then_fail")).await;

    let config = fast_config().with_error_notifier(notifier.clone());
    let locker = Locker::start(Arc::new(store.clone()), registry, config).unwrap();
    let done = wait_for(&store, job.id, finished).await.unwrap();
    locker.stop().await.unwrap();

    assert_eq!(*notifier.kinds.lock(), vec![ErrorKind::Failed]);
    assert_eq!(done.error_count, 0);
    assert!(done.expired_at.is_none());
    assert_eq!(locker.snapshot().counters.finished, 1);
}

#[tokio::test]
async fn worker_thresholds_bound_what_is_claimed() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);
    let slow = enqueue(&client, JobRequest::new("record").with_priority(50)).await;
    let urgent = enqueue(&client, JobRequest::new("record").with_priority(5)).await;

    let config = fast_config().with_worker_priorities(vec![Some(10)]);
    let locker = Locker::start(Arc::new(store.clone()), registry, config).unwrap();
    wait_for(&store, urgent.id, finished).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    locker.stop().await.unwrap();

    assert_eq!(recorder.ids(), vec![urgent.id]);
    let slow = store.get_job(slow.id).await.unwrap().unwrap();
    assert!(slow.finished_at.is_none());
    assert!(!store.is_locked(slow.id));
}

#[tokio::test]
async fn queue_names_limit_claims() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);
    let other = enqueue(&client, JobRequest::new("record").with_queue("reports")).await;
    let mail = enqueue(&client, JobRequest::new("record").with_queue("mail")).await;

    let config = fast_config().with_queue_names(["mail"]);
    let locker = Locker::start(Arc::new(store.clone()), registry, config).unwrap();
    wait_for(&store, mail.id, finished).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    locker.stop().await.unwrap();

    assert_eq!(recorder.ids(), vec![mail.id]);
    assert!(store.get_job(other.id).await.unwrap().unwrap().finished_at.is_none());
}

#[tokio::test]
async fn destroy_finished_jobs_deletes_rows() {
    let store = MemoryStore::new();
    let recorder = Recorder::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", recorder.clone()));
    let client = client(&store, &registry);
    let job = enqueue(&client, JobRequest::new("record")).await;

    let config = fast_config().with_destroy_finished_jobs(true);
    let locker = Locker::start(Arc::new(store.clone()), registry, config).unwrap();
    wait_for(&store, job.id, |job| job.is_none()).await;
    locker.stop().await.unwrap();

    assert_eq!(recorder.ids(), vec![job.id]);
    assert!(store.is_empty());
}

#[tokio::test]
async fn unknown_classes_are_retried_like_failures() {
    let store = MemoryStore::new();
    let client = client(&store, &JobRegistry::new());
    let job = enqueue(&client, JobRequest::new("not_deployed_yet")).await;

    let config = fast_config().with_retry_interval(RetryInterval::fixed(Duration::from_secs(3600)));
    let locker = Locker::start(Arc::new(store.clone()), JobRegistry::new(), config).unwrap();
    let retried = wait_for(&store, job.id, |job| job.is_some_and(|job| job.error_count == 1))
        .await
        .unwrap();
    locker.stop().await.unwrap();

    assert!(retried.finished_at.is_none());
    assert!(retried.expired_at.is_none());
    assert!(retried
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("not_deployed_yet")));
}

#[tokio::test]
async fn middleware_wraps_every_run() {
    let store = MemoryStore::new();
    let counting = Counting::default();
    let registry = JobRegistry::new().with(JobDescriptor::new("record", Recorder::default()));
    let client = client(&store, &registry);
    let a = enqueue(&client, JobRequest::new("record")).await;
    let b = enqueue(&client, JobRequest::new("record")).await;

    let config = fast_config().with_middleware(counting.clone());
    let locker = Locker::start(Arc::new(store.clone()), registry, config).unwrap();
    wait_for(&store, a.id, finished).await;
    wait_for(&store, b.id, finished).await;
    locker.stop().await.unwrap();

    assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
}
