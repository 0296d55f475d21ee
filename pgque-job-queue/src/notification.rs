//! New-job notification payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::JobRecord;

/// Channel producers publish to on insert.
pub const NOTIFICATION_CHANNEL: &str = "pgque_jobs";

/// Payloads longer than this are replaced by [`POLL_SENTINEL`].
pub const MAX_PAYLOAD_BYTES: usize = 1024;

/// Payload that carries no job and asks lockers for a full poll.
pub const POLL_SENTINEL: &str = "{}";

/// What a locker needs to decide whether a new job concerns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub id: i64,
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub job_class: String,
}

impl JobNotification {
    /// Encode for the wire, falling back to the sentinel when too large.
    pub fn encode(&self) -> String {
        serde_json::to_string(self)
            .ok()
            .filter(|payload| payload.len() <= MAX_PAYLOAD_BYTES)
            .unwrap_or_else(|| POLL_SENTINEL.to_owned())
    }

    /// Parse a payload. `None` means "poll everything".
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

impl From<&JobRecord> for JobNotification {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id,
            queue: job.queue.clone(),
            priority: job.priority,
            run_at: job.run_at,
            job_class: job.job_class.clone(),
        }
    }
}
