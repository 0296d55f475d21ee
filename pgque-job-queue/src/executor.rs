//! Job handlers and the registry that maps job classes to them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::JobError;
use crate::retry::{RetryInterval, RetryPolicy};

/// The behavior of a job class.
///
/// `run` receives the job's context, reads its arguments from it and may
/// call one of the resolution actions (`finish`, `retry_in`, `expire`,
/// `destroy`). If it returns `Ok(())` without resolving, the job is
/// finished. Returning `Err(JobError::Failed(..))` counts against the retry
/// budget; `Err(JobError::Fatal(..))` ends the worker slot.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError>;
}

/// Deletes its row without doing anything else.
///
/// Useful for retiring job classes: re-register the old class name with this
/// handler and any stragglers are removed as they come due.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpJob;

#[async_trait]
impl JobHandler for NoOpJob {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        ctx.destroy().await
    }
}

/// Defaults and behavior registered for one job class.
#[derive(Clone)]
pub struct JobDescriptor {
    class: String,
    handler: Arc<dyn JobHandler>,
    queue: Option<String>,
    priority: Option<i16>,
    maximum_retry_count: Option<i32>,
    retry_interval: Option<RetryInterval>,
}

impl JobDescriptor {
    pub fn new<H: JobHandler + 'static>(class: impl Into<String>, handler: H) -> Self {
        Self {
            class: class.into(),
            handler: Arc::new(handler),
            queue: None,
            priority: None,
            maximum_retry_count: None,
            retry_interval: None,
        }
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
    pub fn with_maximum_retry_count(mut self, count: i32) -> Self {
        self.maximum_retry_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: RetryInterval) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    #[inline]
    pub fn class(&self) -> &str {
        &self.class
    }

    #[inline]
    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    #[inline]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    #[inline]
    pub fn priority(&self) -> Option<i16> {
        self.priority
    }

    /// This class's retry policy, falling back to `defaults` for anything it
    /// does not override.
    pub fn retry_policy(&self, defaults: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            maximum_retry_count: self
                .maximum_retry_count
                .unwrap_or(defaults.maximum_retry_count),
            retry_interval: self
                .retry_interval
                .clone()
                .unwrap_or_else(|| defaults.retry_interval.clone()),
        }
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("class", &self.class)
            .field("handler", &"<dyn JobHandler>")
            .field("queue", &self.queue)
            .field("priority", &self.priority)
            .field("maximum_retry_count", &self.maximum_retry_count)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

/// Flat lookup table from job class name to its descriptor.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    descriptors: HashMap<String, Arc<JobDescriptor>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one for the same class.
    #[must_use]
    pub fn with(mut self, descriptor: JobDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn register(&mut self, descriptor: JobDescriptor) {
        self.descriptors
            .insert(descriptor.class.clone(), Arc::new(descriptor));
    }

    #[inline]
    pub fn get(&self, class: &str) -> Option<&Arc<JobDescriptor>> {
        self.descriptors.get(class)
    }

    #[inline]
    pub fn contains(&self, class: &str) -> bool {
        self.descriptors.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn descriptor_overrides_fall_back_to_defaults() {
        let defaults = RetryPolicy::new(15, RetryInterval::fixed(Duration::from_secs(1)));

        let plain = JobDescriptor::new("noop", NoOpJob);
        let policy = plain.retry_policy(&defaults);
        assert_eq!(policy.maximum_retry_count, 15);
        assert_eq!(policy.retry_interval.interval_for(3), Duration::from_secs(1));

        let tuned = JobDescriptor::new("mail", NoOpJob)
            .with_maximum_retry_count(2)
            .with_retry_interval(RetryInterval::fixed(Duration::from_secs(30)));
        let policy = tuned.retry_policy(&defaults);
        assert_eq!(policy.maximum_retry_count, 2);
        assert_eq!(policy.retry_interval.interval_for(1), Duration::from_secs(30));
    }

    #[test]
    fn registry_lookup_by_class() {
        let registry = JobRegistry::new()
            .with(JobDescriptor::new("a", NoOpJob).with_priority(5))
            .with(JobDescriptor::new("b", NoOpJob).with_queue("mail"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a").and_then(|d| d.priority()), Some(5));
        assert_eq!(registry.get("b").and_then(|d| d.queue()), Some("mail"));
        assert!(!registry.contains("c"));
    }
}
