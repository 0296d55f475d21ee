//! Hook for reporting job and infrastructure errors.

use serde::Serialize;

use crate::middleware::JobLabels;

/// What kind of failure is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A recoverable job error; the job was rescheduled.
    Retried,
    /// A job error past the retry budget; the job was expired.
    Expired,
    /// A job error raised after the job resolved itself; the resolution
    /// stands.
    Failed,
    /// An unrecoverable job error; the worker slot was replaced.
    Fatal,
    /// Job code broke the resolution contract.
    Contract,
    /// The claim session, subscription or store failed.
    Infrastructure,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retried => "retried",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Fatal => "fatal",
            Self::Contract => "contract",
            Self::Infrastructure => "infrastructure",
        }
    }
}

/// One reported failure.
#[derive(Debug, Clone, Copy)]
pub struct ErrorReport<'a> {
    pub kind: ErrorKind,
    /// The job involved, if any.
    pub labels: Option<&'a JobLabels>,
    pub message: &'a str,
}

/// Receives every error the locker and its workers see.
///
/// Called inline on the worker or locker task: implementations should hand
/// slow work off rather than block.
pub trait ErrorNotifier: Send + Sync {
    fn notify(&self, report: &ErrorReport<'_>);
}

/// Default notifier: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ErrorNotifier for TracingNotifier {
    fn notify(&self, report: &ErrorReport<'_>) {
        match (report.kind, report.labels) {
            (ErrorKind::Retried | ErrorKind::Failed, Some(labels)) => tracing::warn!(
                kind = report.kind.as_str(),
                job_id = labels.id,
                job_class = %labels.job_class,
                error_count = labels.error_count,
                error = report.message,
                "job error"
            ),
            (kind, Some(labels)) => tracing::error!(
                kind = kind.as_str(),
                job_id = labels.id,
                job_class = %labels.job_class,
                error_count = labels.error_count,
                error = report.message,
                "job error"
            ),
            (kind, None) => tracing::warn!(kind = kind.as_str(), error = report.message, "locker error"),
        }
    }
}
