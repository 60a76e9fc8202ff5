//! Lifecycle hooks: synchronous, fire-and-forget callbacks the
//! dispatcher invokes around a run's lifecycle transitions.
//!
//! A hook that panics or returns an error is logged and otherwise
//! ignored — hooks observe the lifecycle, they don't gate it.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::run::WorkflowRun;

/// A single lifecycle callback.
pub type Hook = Arc<dyn Fn(&WorkflowRun) + Send + Sync>;

/// The five lifecycle hooks a [`crate::workflow::WorkflowDefinition`] may
/// carry.
#[derive(Clone, Default)]
pub struct Hooks {
    on_start: Option<Hook>,
    on_success: Option<Hook>,
    on_failure: Option<Hook>,
    on_complete: Option<Hook>,
    on_cancel: Option<Hook>,
}

impl Hooks {
    /// No hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per dispatch, before the handler runs.
    pub fn with_on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowRun) + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(f));
        self
    }

    /// Called when a run reaches `Completed`.
    pub fn with_on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowRun) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called when a run reaches terminal `Failed`.
    pub fn with_on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowRun) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    /// Called when a run reaches any terminal status.
    pub fn with_on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowRun) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Called when a run reaches `Cancelled`.
    pub fn with_on_cancel<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowRun) + Send + Sync + 'static,
    {
        self.on_cancel = Some(Arc::new(f));
        self
    }

    pub(crate) fn fire_start(&self, run: &WorkflowRun) {
        invoke(&self.on_start, run, "on_start");
    }

    pub(crate) fn fire_success(&self, run: &WorkflowRun) {
        invoke(&self.on_success, run, "on_success");
    }

    pub(crate) fn fire_failure(&self, run: &WorkflowRun) {
        invoke(&self.on_failure, run, "on_failure");
    }

    pub(crate) fn fire_complete(&self, run: &WorkflowRun) {
        invoke(&self.on_complete, run, "on_complete");
    }

    pub(crate) fn fire_cancel(&self, run: &WorkflowRun) {
        invoke(&self.on_cancel, run, "on_cancel");
    }
}

fn invoke(hook: &Option<Hook>, run: &WorkflowRun, name: &str) {
    if let Some(hook) = hook {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(run)));
        if outcome.is_err() {
            warn!(hook = name, run_id = %run.id, "lifecycle hook panicked");
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunStatus, WorkflowRun};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_run() -> WorkflowRun {
        let now = chrono::Utc::now();
        WorkflowRun {
            id: crate::id::RunId::generate(),
            workflow_id: "w".into(),
            resource_id: None,
            status: RunStatus::Running,
            input: serde_json::json!({}),
            output: None,
            error: None,
            current_step_id: None,
            timeline: Default::default(),
            created_at: now,
            updated_at: now,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            timeout_at: None,
            retry_count: 0,
            max_retries: 0,
            job_id: None,
            cron: None,
            timezone: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn fires_the_matching_hook_only() {
        let start_calls = Arc::new(AtomicUsize::new(0));
        let success_calls = Arc::new(AtomicUsize::new(0));
        let (s1, s2) = (start_calls.clone(), success_calls.clone());

        let hooks = Hooks::new()
            .with_on_start(move |_| {
                s1.fetch_add(1, Ordering::SeqCst);
            })
            .with_on_success(move |_| {
                s2.fetch_add(1, Ordering::SeqCst);
            });

        hooks.fire_start(&sample_run());
        assert_eq!(start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(success_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_panicking_hook_does_not_propagate() {
        let hooks = Hooks::new().with_on_start(|_| panic!("boom"));
        hooks.fire_start(&sample_run());
    }
}
