//! Locker telemetry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::types::{Metajob, Outcome};

/// Running totals since the locker started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockerCounters {
    pub claimed: u64,
    pub finished: u64,
    pub retried: u64,
    pub expired: u64,
    pub destroyed: u64,
    pub released: u64,
    pub worker_restarts: u64,
    pub infrastructure_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightBucket {
    pub queue: String,
    pub priority: i16,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub index: usize,
    pub priority_threshold: Option<i16>,
    pub busy: bool,
    pub job_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub job_class: String,
    pub job_id: i64,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a locker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockerSnapshot {
    /// Claimed and not yet finalized, per queue and priority.
    pub in_flight: Vec<InFlightBucket>,
    /// Claimed jobs waiting for a worker.
    pub queued: usize,
    pub workers: Vec<WorkerSnapshot>,
    pub last_errors: Vec<LastError>,
    pub counters: LockerCounters,
}

impl LockerSnapshot {
    pub fn in_flight_total(&self) -> usize {
        self.in_flight.iter().map(|bucket| bucket.count).sum()
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|worker| worker.busy).count()
    }
}

#[derive(Debug, Default)]
struct TelemetryState {
    in_flight: BTreeMap<(String, i16), usize>,
    workers: Vec<WorkerSnapshot>,
    last_errors: BTreeMap<String, LastError>,
    counters: LockerCounters,
}

/// Shared between the locker and its workers.
#[derive(Debug, Default)]
pub(crate) struct Telemetry {
    state: Mutex<TelemetryState>,
}

impl Telemetry {
    pub(crate) fn new(thresholds: &[Option<i16>]) -> Self {
        let workers = thresholds
            .iter()
            .enumerate()
            .map(|(index, threshold)| WorkerSnapshot {
                index,
                priority_threshold: *threshold,
                busy: false,
                job_id: None,
            })
            .collect();
        Self {
            state: Mutex::new(TelemetryState {
                workers,
                ..TelemetryState::default()
            }),
        }
    }

    pub(crate) fn claimed(&self, metajob: &Metajob) {
        let mut state = self.state.lock();
        *state
            .in_flight
            .entry((metajob.queue.clone(), metajob.priority))
            .or_insert(0) += 1;
        state.counters.claimed += 1;
    }

    /// A claim left this locker, either finalized or dropped unstarted.
    pub(crate) fn settled(&self, metajob: &Metajob, outcome: Outcome) {
        let mut state = self.state.lock();
        let key = (metajob.queue.clone(), metajob.priority);
        if let Some(count) = state.in_flight.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.in_flight.remove(&key);
            }
        }
        let counters = &mut state.counters;
        match outcome {
            Outcome::Finished => counters.finished += 1,
            Outcome::Retried => counters.retried += 1,
            Outcome::Expired => counters.expired += 1,
            Outcome::Destroyed => counters.destroyed += 1,
            Outcome::Released => counters.released += 1,
        }
    }

    pub(crate) fn worker_busy(&self, index: usize, job_id: i64) {
        if let Some(worker) = self.state.lock().workers.get_mut(index) {
            worker.busy = true;
            worker.job_id = Some(job_id);
        }
    }

    pub(crate) fn worker_idle(&self, index: usize) {
        if let Some(worker) = self.state.lock().workers.get_mut(index) {
            worker.busy = false;
            worker.job_id = None;
        }
    }

    /// The job a worker slot was running, if any.
    pub(crate) fn current_job(&self, index: usize) -> Option<i64> {
        self.state
            .lock()
            .workers
            .get(index)
            .and_then(|worker| worker.job_id)
    }

    pub(crate) fn job_error(&self, job_class: &str, job_id: i64, message: &str) {
        self.state.lock().last_errors.insert(
            job_class.to_owned(),
            LastError {
                job_class: job_class.to_owned(),
                job_id,
                message: message.to_owned(),
                at: Utc::now(),
            },
        );
    }

    pub(crate) fn worker_restarted(&self) {
        self.state.lock().counters.worker_restarts += 1;
    }

    pub(crate) fn infrastructure_error(&self) {
        self.state.lock().counters.infrastructure_errors += 1;
    }

    pub(crate) fn snapshot(&self, queued: usize) -> LockerSnapshot {
        let state = self.state.lock();
        LockerSnapshot {
            in_flight: state
                .in_flight
                .iter()
                .map(|((queue, priority), count)| InFlightBucket {
                    queue: queue.clone(),
                    priority: *priority,
                    count: *count,
                })
                .collect(),
            queued,
            workers: state.workers.clone(),
            last_errors: state.last_errors.values().cloned().collect(),
            counters: state.counters,
        }
    }
}
