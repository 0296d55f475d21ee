//! Core types for the job queue system.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Queue used when neither the request nor the job class names one.
pub const DEFAULT_QUEUE: &str = "default";

/// Priority used when neither the request nor the job class sets one.
pub const DEFAULT_PRIORITY: i16 = 100;

/// Row layout version written with every job.
pub const SCHEMA_VERSION: i32 = 1;

/// Maximum number of tags a job may carry.
pub const MAX_TAGS: usize = 5;

/// Maximum length of a single tag.
pub const MAX_TAG_LENGTH: usize = 100;

/// Stored error messages are cut to this many characters.
pub const MAX_ERROR_LENGTH: usize = 500;

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub first_run_at: DateTime<Utc>,
    pub job_class: String,
    #[sqlx(json)]
    pub args: Vec<Value>,
    #[sqlx(json)]
    pub kwargs: Map<String, Value>,
    #[sqlx(json)]
    pub data: Value,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub schema_version: i32,
}

impl JobRecord {
    /// The ordering/identity descriptor for this row.
    #[inline]
    pub fn metajob(&self) -> Metajob {
        Metajob {
            id: self.id,
            queue: self.queue.clone(),
            priority: self.priority,
            run_at: self.run_at,
        }
    }

    /// Finished or expired rows are never claimed again.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some() || self.expired_at.is_some()
    }

    /// Non-terminal and due at `now`.
    #[inline]
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.run_at <= now
    }

    pub fn status(&self) -> JobStatus {
        if self.finished_at.is_some() {
            JobStatus::Finished
        } else if self.expired_at.is_some() {
            JobStatus::Expired
        } else if self.error_count > 0 {
            JobStatus::Errored
        } else {
            JobStatus::Scheduled
        }
    }

    /// Tags recorded under `data.tags`.
    pub fn tags(&self) -> Vec<&str> {
        self.data
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Persisted state of a row as seen from outside the locker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Errored,
    Finished,
    Expired,
}

impl JobStatus {
    /// Returns true if this status represents a terminal state.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Expired)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Scheduled => "scheduled",
            Self::Errored => "errored",
            Self::Finished => "finished",
            Self::Expired => "expired",
        })
    }
}

/// In-memory descriptor of a claimed job.
///
/// Ordered by priority, then run_at, then id, ascending: the smallest
/// Metajob is the one to run first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow)]
pub struct Metajob {
    pub id: i64,
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
}

impl Metajob {
    #[inline]
    fn sort_key(&self) -> (i16, DateTime<Utc>, i64) {
        (self.priority, self.run_at, self.id)
    }
}

impl Ord for Metajob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.queue.cmp(&other.queue))
    }
}

impl PartialOrd for Metajob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A request to enqueue a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub priority: Option<i16>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl JobRequest {
    #[inline]
    pub fn new(job_class: impl Into<String>) -> Self {
        Self {
            job_class: job_class.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A fully resolved insert: every option has been defaulted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    pub priority: i16,
    /// `None` means "now" as seen by the store.
    pub run_at: Option<DateTime<Utc>>,
    pub job_class: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub data: Value,
}

/// How a worker left a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Finished,
    Retried,
    Expired,
    Destroyed,
    /// The row was not touched: it vanished, became ineligible, could not be
    /// loaded, or its worker hit a fatal error.
    Released,
}

impl Outcome {
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Retried => "retried",
            Self::Expired => "expired",
            Self::Destroyed => "destroyed",
            Self::Released => "released",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry on the result queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub metajob: Metajob,
    pub outcome: Outcome,
}

/// Result returned after a job has been enqueued.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// The row was inserted and lockers were notified.
    Enqueued(JobRecord),
    /// Synchronous mode: the job ran inline and was never persisted.
    Ran { job: JobRecord, outcome: Outcome },
}

impl EnqueueResult {
    pub fn job(&self) -> &JobRecord {
        match self {
            Self::Enqueued(job) | Self::Ran { job, .. } => job,
        }
    }
}

/// Per-class counts over non-terminal rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobClassStats {
    pub job_class: String,
    pub count: i64,
    pub count_working: i64,
    pub count_errored: i64,
    pub highest_error_count: i32,
    pub oldest_run_at: Option<DateTime<Utc>>,
}

/// Cut an error message to [`MAX_ERROR_LENGTH`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LENGTH) {
        Some((idx, _)) => message[..idx].to_owned(),
        None => message.to_owned(),
    }
}
