//! Bounded priority buffer between the locker and its workers.

use std::collections::BTreeSet;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::Metajob;

/// Thread-safe priority queue of claimed Metajobs.
///
/// Ordering is `(priority, run_at, id)` ascending. A full queue rejects
/// pushes instead of blocking: that rejection is what stops the locker from
/// claiming more than the workers can absorb.
#[derive(Debug)]
pub struct JobQueue {
    capacity: usize,
    jobs: Mutex<BTreeSet<Metajob>>,
    available: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: Mutex::new(BTreeSet::new()),
            available: Notify::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Free slots.
    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Add a Metajob, handing it back if the queue is full.
    pub fn push(&self, metajob: Metajob) -> Result<(), Metajob> {
        {
            let mut jobs = self.jobs.lock();
            if jobs.len() >= self.capacity {
                return Err(metajob);
            }
            jobs.insert(metajob);
        }
        self.available.notify_waiters();
        Ok(())
    }

    /// Remove the best Metajob whose priority does not exceed `threshold`.
    pub fn try_pop(&self, threshold: Option<i16>) -> Option<Metajob> {
        let mut jobs = self.jobs.lock();
        let first = jobs.first()?;
        if threshold.is_some_and(|max| first.priority > max) {
            // Sorted by priority: nothing further back can qualify.
            return None;
        }
        jobs.pop_first()
    }

    /// Wait up to `timeout` for a Metajob acceptable under `threshold`.
    pub async fn pop(&self, threshold: Option<i16>, timeout: Duration) -> Option<Metajob> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(job) = self.try_pop(threshold) {
                return Some(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Atomically remove up to `count` entries from queue `name`, best first.
    pub fn shift_by_queue(&self, name: &str, count: usize) -> Vec<Metajob> {
        let mut jobs = self.jobs.lock();
        let picked: Vec<Metajob> = jobs
            .iter()
            .filter(|job| job.queue == name)
            .take(count)
            .cloned()
            .collect();
        for job in &picked {
            jobs.remove(job);
        }
        picked
    }

    /// Empty the queue, returning everything that was buffered.
    pub fn clear(&self) -> Vec<Metajob> {
        let mut jobs = self.jobs.lock();
        std::mem::take(&mut *jobs).into_iter().collect()
    }

    /// Ids currently buffered.
    pub fn ids(&self) -> Vec<i64> {
        self.jobs.lock().iter().map(|job| job.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;

    fn meta(id: i64, queue: &str, priority: i16, run_at: DateTime<Utc>) -> Metajob {
        Metajob {
            id,
            queue: queue.to_owned(),
            priority,
            run_at,
        }
    }

    #[test]
    fn pops_in_priority_order() {
        let now = Utc::now();
        let queue = JobQueue::new(8);
        queue.push(meta(1, "default", 5, now)).unwrap();
        queue.push(meta(2, "default", 1, now)).unwrap();
        queue.push(meta(3, "default", 5, now - chrono::Duration::seconds(5))).unwrap();

        assert_eq!(queue.try_pop(None).map(|j| j.id), Some(2));
        assert_eq!(queue.try_pop(None).map(|j| j.id), Some(3));
        assert_eq!(queue.try_pop(None).map(|j| j.id), Some(1));
        assert!(queue.try_pop(None).is_none());
    }

    #[test]
    fn push_beyond_capacity_is_rejected_without_disturbing_entries() {
        let now = Utc::now();
        let queue = JobQueue::new(2);
        queue.push(meta(1, "default", 10, now)).unwrap();
        queue.push(meta(2, "default", 20, now)).unwrap();

        let rejected = queue.push(meta(3, "default", 1, now)).unwrap_err();
        assert_eq!(rejected.id, 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.space(), 0);
        assert_eq!(queue.ids(), vec![1, 2]);
    }

    #[test]
    fn threshold_filters_low_urgency_jobs() {
        let now = Utc::now();
        let queue = JobQueue::new(4);
        queue.push(meta(1, "default", 50, now)).unwrap();

        assert!(queue.try_pop(Some(10)).is_none());
        assert_eq!(queue.try_pop(Some(50)).map(|j| j.id), Some(1));
    }

    #[test]
    fn shift_by_queue_takes_only_matching_entries() {
        let now = Utc::now();
        let queue = JobQueue::new(8);
        queue.push(meta(1, "mail", 3, now)).unwrap();
        queue.push(meta(2, "default", 1, now)).unwrap();
        queue.push(meta(3, "mail", 2, now)).unwrap();
        queue.push(meta(4, "mail", 9, now)).unwrap();

        let shifted: Vec<i64> = queue.shift_by_queue("mail", 2).iter().map(|j| j.id).collect();
        assert_eq!(shifted, vec![3, 1]);
        assert_eq!(queue.ids(), vec![2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_on_empty_queue_times_out() {
        let queue = JobQueue::new(1);
        let started = Instant::now();
        assert!(queue.pop(None, Duration::from_millis(200)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(JobQueue::new(1));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(None, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(meta(42, "default", 1, Utc::now())).unwrap();

        let popped = waiter.await.unwrap();
        assert_eq!(popped.map(|j| j.id), Some(42));
    }
}
