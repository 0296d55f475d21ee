use std::time::Duration;

use anyhow::Context;
use pgque_config::{Config, LockerSettings};
use pgque_db_connection::DbConnectionConfig;
use pgque_job_queue::{JobDescriptor, JobRegistry, JobRequest, LockerConfig, NoOpJob};

use crate::cli::{EnqueueArgs, WorkArgs};

/// Job class of the built-in handler that deletes its row.
pub const NOOP_JOB_CLASS: &str = "pgque.noop";

/// Build database connection config from application config.
pub fn database_config_from_config(cfg: &Config) -> anyhow::Result<DbConnectionConfig> {
    let url = cfg
        .database
        .connection_url()
        .context("database connection is not configured")?;
    let db = DbConnectionConfig {
        max_connections: cfg.database.max_connections,
        min_connections: cfg.database.min_connections,
        connect_timeout_secs: cfg.database.connect_timeout_secs,
        application_name: cfg.database.application_name.clone(),
        ..DbConnectionConfig::new(url)
    };
    db.validate()?;
    Ok(db)
}

/// Translate the `locker` section, then apply command-line overrides.
pub fn locker_config_from_config(settings: &LockerSettings, args: &WorkArgs) -> LockerConfig {
    let queues = if args.queues.is_empty() {
        settings.queues.clone()
    } else {
        args.queues.clone()
    };
    LockerConfig::default()
        .with_worker_count(args.workers.unwrap_or(settings.worker_count))
        .with_worker_priorities(settings.worker_priorities.clone())
        .with_queue_names(queues)
        .with_poll_interval(Duration::from_millis(settings.poll_interval_ms))
        .with_wait_for_notifications(settings.wait_for_notifications)
        .with_job_queue_capacity(settings.job_queue_capacity)
        .with_maximum_retry_count(settings.maximum_retry_count)
        .with_destroy_finished_jobs(settings.destroy_finished_jobs)
        .with_shutdown_timeout(Duration::from_secs(settings.shutdown_timeout_secs))
        .with_backoff(
            Duration::from_millis(settings.minimum_backoff_ms),
            Duration::from_millis(settings.maximum_backoff_ms),
        )
}

/// Handlers this binary can run: the no-op class plus any retired classes.
pub fn builtin_registry(retire: &[String]) -> JobRegistry {
    let mut registry = JobRegistry::new().with(JobDescriptor::new(NOOP_JOB_CLASS, NoOpJob));
    for class in retire {
        registry.register(JobDescriptor::new(class.as_str(), NoOpJob));
    }
    registry
}

/// Parse the JSON arguments of `pgque enqueue` into a request.
pub fn job_request_from_args(args: &EnqueueArgs) -> anyhow::Result<JobRequest> {
    let positional: Vec<serde_json::Value> =
        serde_json::from_str(&args.args).context("--args must be a JSON array")?;
    let keywords: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&args.kwargs).context("--kwargs must be a JSON object")?;

    let mut request = JobRequest::new(args.job_class.as_str())
        .with_args(positional)
        .with_kwargs(keywords);
    if let Some(queue) = &args.queue {
        request = request.with_queue(queue.as_str());
    }
    if let Some(priority) = args.priority {
        request = request.with_priority(priority);
    }
    if let Some(run_at) = args.run_at {
        request = request.with_run_at(run_at);
    }
    for tag in &args.tags {
        request = request.with_tag(tag.as_str());
    }
    Ok(request)
}
