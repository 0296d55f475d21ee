//! Completed-job outcomes on their way back to the locker.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::JobResult;

/// Unbounded queue of [`JobResult`]s, drained by the locker's control loop.
#[derive(Debug, Default)]
pub struct ResultQueue {
    results: Mutex<VecDeque<JobResult>>,
    pushed: Notify,
}

impl ResultQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: JobResult) {
        self.results.lock().push_back(result);
        // notify_one stores a permit, so a locker that is not waiting yet
        // still sees this push on its next wait.
        self.pushed.notify_one();
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<JobResult> {
        self.results.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// Resolves after the next push (or immediately if one happened since
    /// the last wait).
    pub async fn wait(&self) {
        self.pushed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metajob, Outcome};
    use chrono::Utc;
    use std::time::Duration;

    fn result(id: i64, outcome: Outcome) -> JobResult {
        JobResult {
            metajob: Metajob {
                id,
                queue: "default".to_owned(),
                priority: 100,
                run_at: Utc::now(),
            },
            outcome,
        }
    }

    #[test]
    fn drains_in_push_order() {
        let queue = ResultQueue::new();
        queue.push(result(2, Outcome::Finished));
        queue.push(result(1, Outcome::Retried));

        let drained: Vec<(i64, Outcome)> = queue
            .drain()
            .into_iter()
            .map(|r| (r.metajob.id, r.outcome))
            .collect();
        assert_eq!(drained, vec![(2, Outcome::Finished), (1, Outcome::Retried)]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn push_before_wait_is_not_lost() {
        let queue = ResultQueue::new();
        queue.push(result(1, Outcome::Destroyed));
        tokio::time::timeout(Duration::from_millis(100), queue.wait())
            .await
            .expect("stored permit wakes the waiter");
        assert_eq!(queue.len(), 1);
    }
}
