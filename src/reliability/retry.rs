//! Retry/backoff policy for handler failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::duration_millis;

/// Exponential backoff with optional jitter, applied by the dispatcher
/// between a failed dispatch and its next retry.
///
/// # Example
///
/// ```
/// use durastep::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .with_factor(2.0)
///     .with_min_delay(Duration::from_secs(1))
///     .with_max_delay(Some(Duration::from_secs(60)));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Multiplier applied per attempt: `delay = min_delay * factor^(attempt - 1)`.
    pub factor: f64,

    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub min_delay: Duration,

    /// Ceiling on the computed delay; `None` means unbounded.
    #[serde(with = "crate::util::option_duration_millis", default)]
    pub max_delay: Option<Duration>,

    /// When set, the delay is sampled uniformly from `[0.75, 1.25] *
    /// base` instead of being used as-is.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            factor: 2.0,
            min_delay: Duration::from_secs(1),
            max_delay: None,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Start from defaults: factor 2, 1 second minimum delay, unbounded
    /// maximum, jitter on.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy under which the dispatcher never retries.
    pub fn no_retry() -> Self {
        Self {
            factor: 1.0,
            min_delay: Duration::ZERO,
            max_delay: Some(Duration::ZERO),
            jitter: false,
        }
    }

    /// Set the backoff multiplier.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the first-retry delay.
    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Set (or clear) the delay ceiling.
    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying a run whose `retry_count` (pre-increment)
    /// is `retry_count`. `retry_count == 0` is the first retry, so it
    /// is based on `min_delay` alone.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base = self.min_delay.as_secs_f64() * self.factor.powi(retry_count as i32);
        let capped = match self.max_delay {
            Some(max) => base.min(max.as_secs_f64()),
            None => base,
        };

        let seconds = if self.jitter && capped > 0.0 {
            let mut rng = rand::thread_rng();
            rng.gen_range((capped * 0.75)..=(capped * 1.25))
        } else {
            capped
        };

        Duration::from_secs_f64(seconds.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_uses_min_delay() {
        let policy = RetryPolicy::new().with_jitter(false);
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
    }

    #[test]
    fn delay_grows_by_factor_per_retry() {
        let policy = RetryPolicy::new().with_jitter(false);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
    }

    #[test]
    fn max_delay_caps_the_computed_value() {
        let policy = RetryPolicy::new()
            .with_jitter(false)
            .with_max_delay(Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_within_quarter_range() {
        let policy = RetryPolicy::new().with_min_delay(Duration::from_secs(10));
        for retry_count in 0..3 {
            let delay = policy.delay_for_retry(retry_count).as_secs_f64();
            let base = 10.0 * 2f64.powi(retry_count as i32);
            assert!(delay >= base * 0.75 - 0.001);
            assert!(delay <= base * 1.25 + 0.001);
        }
    }

    #[test]
    fn no_retry_policy_is_instantaneous() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
    }
}
