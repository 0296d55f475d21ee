//! Retry budget and backoff curves.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Retries allowed before a failing job is expired.
pub const DEFAULT_MAXIMUM_RETRY_COUNT: i32 = 15;

const EXPONENTIAL_FACTOR: f64 = 2.0;

/// Delay before the next attempt, as a function of the (already incremented)
/// error count.
#[derive(Clone)]
pub struct RetryInterval(Arc<dyn Fn(i32) -> Duration + Send + Sync>);

impl RetryInterval {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(i32) -> Duration + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// `error_count^4 + 3` seconds.
    pub fn polynomial() -> Self {
        Self::new(|error_count| {
            let count = u64::try_from(error_count.max(0)).unwrap_or(0);
            Duration::from_secs(count.saturating_pow(4).saturating_add(3))
        })
    }

    pub fn fixed(interval: Duration) -> Self {
        Self::new(move |_| interval)
    }

    /// `base * 2^(error_count - 1)` capped at `max`, with full jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::new(move |error_count| {
            let ceiling = exponential_ceiling(base, max, error_count);
            if ceiling.is_zero() {
                return ceiling;
            }
            let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(rand::rng().random_range(0..=millis))
        })
    }

    #[inline]
    pub fn interval_for(&self, error_count: i32) -> Duration {
        (self.0)(error_count)
    }
}

impl Default for RetryInterval {
    fn default() -> Self {
        Self::polynomial()
    }
}

impl fmt::Debug for RetryInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryInterval(<fn>)")
    }
}

pub(crate) fn exponential_ceiling(base: Duration, max: Duration, error_count: i32) -> Duration {
    let exponent = error_count.saturating_sub(1).clamp(0, 62);
    let delay = base.as_secs_f64() * EXPONENTIAL_FACTOR.powi(exponent);
    if delay >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(delay)
    }
}

/// Retry budget plus backoff curve for one job class.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub maximum_retry_count: i32,
    pub retry_interval: RetryInterval,
}

impl RetryPolicy {
    pub fn new(maximum_retry_count: i32, retry_interval: RetryInterval) -> Self {
        Self {
            maximum_retry_count,
            retry_interval,
        }
    }

    /// Whether a job whose error count has just become `error_count` is out
    /// of retries.
    #[inline]
    pub fn is_exhausted(&self, error_count: i32) -> bool {
        error_count > self.maximum_retry_count
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAXIMUM_RETRY_COUNT, RetryInterval::default())
    }
}

/// Backoff for infrastructure failures in the locker loop.
#[derive(Debug, Clone)]
pub(crate) struct FailureBackoff {
    minimum: Duration,
    maximum: Duration,
    failures: i32,
}

impl FailureBackoff {
    pub(crate) fn new(minimum: Duration, maximum: Duration) -> Self {
        Self {
            minimum,
            maximum,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before trying again.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        exponential_ceiling(self.minimum, self.maximum, self.failures)
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }

    pub(crate) fn is_failing(&self) -> bool {
        self.failures > 0
    }
}
