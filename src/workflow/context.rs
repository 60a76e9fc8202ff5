//! The handler-facing surface: [`WorkflowContext`] and its `step`
//! facade.
//!
//! Every `step.*` call follows the same shape: take the row lock, look
//! at the *current* persisted state, decide in one of three ways
//! (short-circuit because the run is no longer live, return a cached
//! value because this step id already has a timeline entry, or advance
//! and run the caller's body), and — only in the advance case — commit
//! a second time once the body resolves. [`HandlerExit::Suspended`] is
//! the typed sentinel a handler's `?` propagates instead of the
//! "return a special marker and stop" shape a callback-based design
//! would need.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::{wait_until_event_name, INTERNAL_PAUSE_EVENT};
use crate::id::RunId;
use crate::queue::{QueueAdapter, SendOptions};
use crate::run::{RunPatch, RunStatus, RunStore, ScheduleContext, TimelineEntry, WaitForMarker};

/// A workflow-level error, carried by `step.run` bodies and by
/// [`HandlerExit::Failed`].
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Human-readable failure message, persisted into `error`.
    pub message: String,
    /// Optional machine-readable error code.
    pub code: Option<String>,
    /// Whether the dispatcher should retry this failure at all. A step
    /// body can set this to `false` to force immediate terminal
    /// failure regardless of the run's remaining retry budget.
    pub retryable: bool,
}

impl WorkflowError {
    /// A retryable error with no code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// An error the dispatcher must not retry.
    pub fn not_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Attach an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// Why a handler invocation stopped short of returning its own output.
#[derive(Debug)]
pub enum HandlerExit {
    /// A step suspended the run (`waitFor`/`pause`/`waitUntil`, or a
    /// short-circuit because the run is no longer live). Not an error:
    /// the dispatcher treats this as "nothing more to do this
    /// dispatch".
    Suspended,
    /// A step body returned an error, or the handler itself failed.
    Failed(WorkflowError),
}

impl From<WorkflowError> for HandlerExit {
    fn from(err: WorkflowError) -> Self {
        HandlerExit::Failed(err)
    }
}

/// The result of one `step.*` call: either the step's value, or a
/// typed reason the handler must stop (propagate with `?`).
pub type StepResult<T> = Result<T, HandlerExit>;

/// What the row lock revealed at the top of a step call.
enum StepBegin {
    ShortCircuit,
    CacheHit(Value),
    Advance,
}

/// The `ctx.step` facade passed to every workflow handler.
#[derive(Clone)]
pub struct StepFacade {
    store: Arc<dyn RunStore>,
    queue: Arc<dyn QueueAdapter>,
    run_id: RunId,
    resource_id: Option<String>,
    resume_queue: String,
}

impl StepFacade {
    pub(crate) fn new(
        store: Arc<dyn RunStore>,
        queue: Arc<dyn QueueAdapter>,
        run_id: RunId,
        resource_id: Option<String>,
        resume_queue: String,
    ) -> Self {
        Self {
            store,
            queue,
            run_id,
            resource_id,
            resume_queue,
        }
    }

    /// Run `body` exactly once for `step_id`, caching its JSON output in
    /// the timeline. Replays return the cached value without calling
    /// `body` again.
    pub async fn run<T, F, Fut>(&self, step_id: &str, body: F) -> StepResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        match self.begin_step(step_id).await? {
            StepBegin::ShortCircuit => Err(HandlerExit::Suspended),
            StepBegin::CacheHit(value) => serde_json::from_value(value)
                .map_err(|e| HandlerExit::Failed(WorkflowError::new(e.to_string()))),
            StepBegin::Advance => match body().await {
                Ok(value) => {
                    let json = serde_json::to_value(&value)
                        .map_err(|e| HandlerExit::Failed(WorkflowError::new(e.to_string())))?;
                    self.complete_step(step_id, json).await?;
                    Ok(value)
                }
                Err(err) => {
                    self.fail_run(&err).await?;
                    Err(HandlerExit::Failed(err))
                }
            },
        }
    }

    /// Suspend until an external event named `event_name` is delivered
    /// (via `trigger_event`), or until `timeout` elapses if set.
    /// Replays return the event's payload without suspending again.
    pub async fn wait_for(
        &self,
        step_id: &str,
        event_name: impl Into<String>,
        timeout: Option<std::time::Duration>,
    ) -> StepResult<Value> {
        let event_name = event_name.into();
        match self.begin_wait(step_id, &event_name, timeout).await? {
            StepBegin::ShortCircuit => Err(HandlerExit::Suspended),
            StepBegin::CacheHit(value) => Ok(value),
            StepBegin::Advance => Err(HandlerExit::Suspended),
        }
    }

    /// Suspend until the run is manually resumed (an internal,
    /// unnamed `waitFor`).
    pub async fn pause(&self, step_id: &str) -> StepResult<()> {
        self.wait_for(step_id, INTERNAL_PAUSE_EVENT, None).await?;
        Ok(())
    }

    /// Suspend until `until`, then resume automatically. Schedules a
    /// delayed delivery of the step's own wake event onto the run's
    /// resume queue the first time this step is reached.
    pub async fn wait_until(&self, step_id: &str, until: DateTime<Utc>) -> StepResult<()> {
        let event_name = wait_until_event_name(step_id);
        let outcome = self.begin_wait(step_id, &event_name, None).await?;
        match outcome {
            StepBegin::ShortCircuit => Err(HandlerExit::Suspended),
            StepBegin::CacheHit(_) => Ok(()),
            StepBegin::Advance => {
                self.queue
                    .send(
                        &self.resume_queue,
                        serde_json::json!({
                            "runId": self.run_id.to_string(),
                            "event": { "name": event_name, "data": Value::Null },
                        }),
                        SendOptions {
                            start_after: Some(until),
                            expire_in_seconds: None,
                        },
                    )
                    .await
                    .map_err(|e| HandlerExit::Failed(WorkflowError::new(e.to_string())))?;
                Err(HandlerExit::Suspended)
            }
        }
    }

    async fn begin_step(&self, step_id: &str) -> StepResult<StepBegin> {
        let step_id = step_id.to_string();
        let outcome: Arc<Mutex<Option<StepBegin>>> = Arc::new(Mutex::new(None));
        let slot = outcome.clone();

        self.store
            .with_exclusive(
                self.run_id,
                self.resource_id.as_deref(),
                Box::new(move |run| {
                    let mut slot = slot.lock().expect("lock poisoned");
                    if run.status.is_terminal() || run.status == RunStatus::Paused {
                        *slot = Some(StepBegin::ShortCircuit);
                        return RunPatch::none();
                    }
                    if let Some(value) = run.step_output(&step_id) {
                        *slot = Some(StepBegin::CacheHit(value.clone()));
                        return RunPatch::none();
                    }
                    *slot = Some(StepBegin::Advance);
                    RunPatch {
                        current_step_id: Some(step_id.clone()),
                        ..RunPatch::none()
                    }
                }),
            )
            .await
            .map_err(|e| HandlerExit::Failed(WorkflowError::new(e.to_string())))?;

        Ok(outcome
            .lock()
            .expect("lock poisoned")
            .take()
            .expect("decide always sets the slot"))
    }

    async fn begin_wait(
        &self,
        step_id: &str,
        event_name: &str,
        timeout: Option<std::time::Duration>,
    ) -> StepResult<StepBegin> {
        let step_id = step_id.to_string();
        let event_name = event_name.to_string();
        let timeout_ms = timeout.map(|d| d.as_millis() as u64);
        let outcome: Arc<Mutex<Option<StepBegin>>> = Arc::new(Mutex::new(None));
        let slot = outcome.clone();

        self.store
            .with_exclusive(
                self.run_id,
                self.resource_id.as_deref(),
                Box::new(move |run| {
                    let mut slot = slot.lock().expect("lock poisoned");
                    if run.status.is_terminal() {
                        *slot = Some(StepBegin::ShortCircuit);
                        return RunPatch::none();
                    }
                    if let Some(value) = run.step_output(&step_id) {
                        *slot = Some(StepBegin::CacheHit(value.clone()));
                        return RunPatch::none();
                    }
                    // No cached output yet: either this is the first
                    // time the handler reached this step, or the
                    // dispatcher just unpaused the run for a mismatched
                    // event (see the dispatcher's event-matching step).
                    // Both cases re-park the run on the same marker.
                    *slot = Some(StepBegin::Advance);
                    let marker = TimelineEntry::WaitFor {
                        wait_for: WaitForMarker {
                            event_name: event_name.clone(),
                            timeout_ms,
                        },
                        timestamp: Utc::now(),
                    };
                    RunPatch {
                        status: Some(RunStatus::Paused),
                        current_step_id: Some(step_id.clone()),
                        paused_at: Some(Some(Utc::now())),
                        timeline_merge: [(crate::run::wait_for_key(&step_id), marker)]
                            .into_iter()
                            .collect(),
                        ..RunPatch::none()
                    }
                }),
            )
            .await
            .map_err(|e| HandlerExit::Failed(WorkflowError::new(e.to_string())))?;

        Ok(outcome
            .lock()
            .expect("lock poisoned")
            .take()
            .expect("decide always sets the slot"))
    }

    async fn complete_step(&self, step_id: &str, output: Value) -> StepResult<()> {
        let entry = TimelineEntry::Output {
            output,
            timestamp: Utc::now(),
        };
        self.store
            .update(
                self.run_id,
                self.resource_id.as_deref(),
                RunPatch {
                    current_step_id: Some(step_id.to_string()),
                    timeline_merge: [(step_id.to_string(), entry)].into_iter().collect(),
                    ..RunPatch::none()
                },
            )
            .await
            .map_err(|e| HandlerExit::Failed(WorkflowError::new(e.to_string())))?;
        Ok(())
    }

    async fn fail_run(&self, err: &WorkflowError) -> StepResult<()> {
        self.store
            .update(
                self.run_id,
                self.resource_id.as_deref(),
                RunPatch {
                    status: Some(RunStatus::Failed),
                    error: Some(Some(err.message.clone())),
                    ..RunPatch::none()
                },
            )
            .await
            .map_err(|e| HandlerExit::Failed(WorkflowError::new(e.to_string())))?;
        Ok(())
    }
}

/// The context handed to a workflow handler on each dispatch.
#[derive(Clone)]
pub struct WorkflowContext {
    /// This run's id.
    pub run_id: RunId,
    /// The run's tenant/entity scope, if any.
    pub resource_id: Option<String>,
    /// The run's original input.
    pub input: Value,
    /// Present only for cron-triggered runs.
    pub schedule: Option<ScheduleContext>,
    /// The step facade.
    pub step: StepFacade,
}

impl WorkflowContext {
    pub(crate) fn new(
        run_id: RunId,
        resource_id: Option<String>,
        input: Value,
        schedule: Option<ScheduleContext>,
        step: StepFacade,
    ) -> Self {
        Self {
            run_id,
            resource_id,
            input,
            schedule,
            step,
        }
    }
}
