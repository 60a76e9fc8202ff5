//! Per-definition options: timeout, retries, cron, concurrency.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reliability::RetryPolicy;
use crate::util::option_duration_millis;

/// An opaque input-schema check. The actual schema language is treated
/// as an external collaborator (see Design Notes); this crate only
/// calls the closure and surfaces its verdict as a [`crate::error::ValidationError`].
pub type InputValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// A concurrency cap on simultaneously-running dispatches of one
/// workflow. When set, the workflow is routed through its own
/// per-definition queue instead of the shared `workflow-run` queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyLimit {
    /// Maximum number of concurrently executing handler dispatches.
    pub limit: u32,
}

/// A cron schedule paired with the timezone its expression is
/// evaluated in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CronConfig {
    /// A standard five/six-field cron expression.
    pub expression: String,
    /// IANA timezone name (e.g. `"UTC"`, `"America/New_York"`).
    pub timezone: String,
}

/// Per-definition options recognized at registration and at
/// `start_workflow` time.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct WorkflowOptions {
    /// Workflow-level timeout; persisted into `timeout_at`. Advisory
    /// only (see Design Notes — event timeout enforcement is out of
    /// scope for this crate).
    #[serde(with = "option_duration_millis", default)]
    pub timeout: Option<Duration>,

    /// Retry ceiling before a failure becomes terminal. `None` means 0
    /// (a single failed attempt fails the run).
    pub max_retries: Option<u32>,

    /// Backoff shape applied between retries. `None` uses
    /// [`RetryPolicy::default`].
    pub retry: Option<RetryPolicy>,

    /// Seconds until an unclaimed dispatch job expires.
    pub expire_in_seconds: Option<u64>,

    /// Per-poll claim batch size override for this workflow's queue.
    pub batch_size: Option<usize>,

    /// Concurrency cap, if this workflow needs its own queue.
    pub concurrency: Option<ConcurrencyLimit>,

    /// Cron schedule, if this workflow is cron-triggered.
    pub cron: Option<CronConfig>,

    /// Optional input schema check, run against `{}` at registration
    /// time (if `cron` is set) and against the caller's input at
    /// `start_workflow` time.
    #[serde(skip)]
    pub input_schema: Option<InputValidator>,
}

impl fmt::Debug for WorkflowOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowOptions")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("retry", &self.retry)
            .field("expire_in_seconds", &self.expire_in_seconds)
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("cron", &self.cron)
            .field("input_schema", &self.input_schema.is_some())
            .finish()
    }
}

impl WorkflowOptions {
    /// Start from defaults (no timeout, default retry policy, no cron,
    /// no concurrency limit).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the workflow-level timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the retry backoff shape.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set a concurrency limit.
    pub fn with_concurrency(mut self, limit: u32) -> Self {
        self.concurrency = Some(ConcurrencyLimit { limit });
        self
    }

    /// Set a cron schedule.
    pub fn with_cron(mut self, expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.cron = Some(CronConfig {
            expression: expression.into(),
            timezone: timezone.into(),
        });
        self
    }

    /// Set an input-schema check.
    pub fn with_input_schema<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.input_schema = Some(Arc::new(validator));
        self
    }

    /// Whether this workflow's dispatches are routed through its own
    /// queue instead of the shared one. Concurrency-limited workflows
    /// only: a cron-triggered workflow gets a *separate* dedicated
    /// queue too, but that one only carries cron ticks — the runs it
    /// creates flow into the shared queue like any other, unless the
    /// same definition also declares a concurrency limit.
    pub fn needs_dedicated_queue(&self) -> bool {
        self.concurrency.is_some()
    }
}
