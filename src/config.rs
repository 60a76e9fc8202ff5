//! Engine-wide tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::duration_millis;

/// Names of the two well-known event names the dispatcher reserves for
/// its own wire protocol. User event names must not collide with
/// these.
pub const INTERNAL_PAUSE_EVENT: &str = "__internal_pause";

/// Builds the reserved event name a `waitUntil` step parks on.
pub fn wait_until_event_name(step_id: &str) -> String {
    format!("__wait_until_{step_id}")
}

/// Configuration for [`crate::Engine::start`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Number of parallel dispatcher workers subscribed to the shared
    /// `workflow-run` queue. Default 3.
    pub worker_count: usize,

    /// Seconds until an enqueued job expires if never claimed, passed to
    /// the queue adapter's `send` as `expire_in_seconds`. Default 300.
    pub job_expiration_seconds: u64,

    /// Queue subscriber poll interval. Default 500ms.
    #[serde(with = "duration_millis")]
    pub polling_interval: Duration,

    /// Maximum jobs claimed per poll. Default 1.
    pub batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            job_expiration_seconds: 300,
            polling_interval: Duration::from_millis(500),
            batch_size: 1,
        }
    }
}

impl EngineConfig {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count (clamped to at least 1).
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set job expiration in seconds.
    pub fn with_job_expiration_seconds(mut self, seconds: u64) -> Self {
        self.job_expiration_seconds = seconds;
        self
    }

    /// Set the queue poll interval.
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the per-poll batch size (clamped to at least 1).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.worker_count, 3);
        assert_eq!(cfg.job_expiration_seconds, 300);
        assert_eq!(cfg.polling_interval, Duration::from_millis(500));
        assert_eq!(cfg.batch_size, 1);
    }

    #[test]
    fn builder_clamps_to_sane_minimums() {
        let cfg = EngineConfig::new().with_worker_count(0).with_batch_size(0);
        assert_eq!(cfg.worker_count, 1);
        assert_eq!(cfg.batch_size, 1);
    }

    #[test]
    fn wait_until_event_name_is_namespaced_per_step() {
        assert_eq!(wait_until_event_name("a"), "__wait_until_a");
        assert_ne!(wait_until_event_name("a"), wait_until_event_name("b"));
    }
}
