//! A PostgreSQL-backed durable workflow orchestration engine.
//!
//! Workflows are plain async closures written against a [`workflow::WorkflowContext`]:
//! each `step.run`/`waitFor`/`pause`/`waitUntil` call is cached against a
//! persisted timeline, so a handler that suspends (waiting on an external
//! event, or simply because its dispatch worker restarted) is replayed from
//! scratch on the next dispatch — prior steps short-circuit off their cached
//! result instead of re-running.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Engine                              │
//! │   (public API: start/cancel/trigger_event, start/stop)       │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                         │
//!                    ▼                         ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────┐
//! │           Dispatcher           │ │       CronScheduler        │
//! │ (claims "process run" jobs,    │ │ (claims cron ticks,        │
//! │  replays the handler)          │ │  creates fresh runs)       │
//! └───────────────────────────────┘ └───────────────────────────┘
//!                    │                         │
//!                    ▼                         ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    RunStore / QueueAdapter                    │
//! │        (Postgres row locks; generic job queue transport)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durastep::prelude::*;
//! use serde_json::json;
//!
//! let def = WorkflowDefinition::builder("greet")
//!     .step("a", StepKind::Run)
//!     .handler(|ctx| Box::pin(async move {
//!         let out = ctx.step.run("a", || async { Ok(json!({"n": 7})) }).await?;
//!         Ok(out)
//!     }));
//!
//! let engine = Engine::new(store, queue, EngineConfig::default());
//! engine.register_workflow(def)?;
//! engine.start().await?;
//! let run = engine.start_workflow("greet", json!({}), StartWorkflowOptions::default()).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod id;
pub mod queue;
pub mod reliability;
mod util;
pub mod run;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use config::EngineConfig;
use engine::{
    dedicated_queue_name, get_run as query_get_run, list_runs as query_list_runs, progress as compute_progress,
    CreateRun, CronScheduler, Dispatcher, Pipeline, Progress, Registry,
};
use error::{EngineError, ValidationError};
use id::RunId;
use queue::{QueueAdapter, SendOptions};
use run::{ListRunsFilter, NewRun, Page, RunPatch, RunStatus, RunStore, WorkflowRun};
use workflow::WorkflowDefinition;

/// Options accepted by [`Engine::start_workflow`], mirroring the
/// `options` bag of the public `startWorkflow` call.
#[derive(Debug, Clone, Default)]
pub struct StartWorkflowOptions {
    /// Override the workflow definition's `max_retries` for this run only.
    pub max_retries: Option<u32>,
    /// De-duplication key; a second call with the same key while the
    /// first run is non-terminal returns the first run unchanged.
    pub idempotency_key: Option<String>,
    /// Workflow-level timeout, persisted into `timeout_at`. Advisory only.
    pub timeout: Option<Duration>,
}

/// The orchestration engine: owns the run store, the job queue, the
/// workflow registry, the dispatch loop, and the cron trigger loop.
///
/// `S`/`Q` are the concrete [`RunStore`]/[`QueueAdapter`] implementations
/// (typically both backed by the same Postgres pool, or both in-memory
/// for tests).
pub struct Engine<S: RunStore, Q: QueueAdapter> {
    store: Arc<S>,
    queue: Arc<Q>,
    registry: Arc<Registry>,
    config: EngineConfig,
    dispatcher: Arc<Dispatcher<S, Q>>,
    cron: Arc<CronScheduler<Q>>,
}

impl<S: RunStore, Q: QueueAdapter> Engine<S, Q> {
    /// Build an engine with the default middleware pipeline (none).
    pub fn new(store: Arc<S>, queue: Arc<Q>, config: EngineConfig) -> Self {
        Self::with_pipeline(store, queue, config, Pipeline::new())
    }

    /// Build an engine running every dispatch through `pipeline` before
    /// the handler itself.
    pub fn with_pipeline(store: Arc<S>, queue: Arc<Q>, config: EngineConfig, pipeline: Pipeline) -> Self {
        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            config.clone(),
            pipeline,
        ));

        let cron_store = store.clone();
        let cron_queue = queue.clone();
        let cron_registry = registry.clone();
        let cron_config = config.clone();
        let create_run: CreateRun = Arc::new(move |workflow_id: String| {
            let store = cron_store.clone();
            let queue = cron_queue.clone();
            let registry = cron_registry.clone();
            let config = cron_config.clone();
            Box::pin(async move {
                if let Err(err) = create_cron_run(&store, &queue, &registry, &config, &workflow_id).await {
                    tracing::warn!(workflow_id = %workflow_id, error = %err, "cron-triggered run creation failed");
                }
            })
        });
        let cron = Arc::new(CronScheduler::new(queue.clone(), registry.clone(), config.clone(), create_run));

        Self { store, queue, registry, config, dispatcher, cron }
    }

    /// Validate and register a workflow definition.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        Ok(self.registry.register_workflow(definition)?)
    }

    /// Drop a workflow's in-memory registration. Does not touch persisted runs.
    pub fn unregister_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        Ok(self.registry.unregister_workflow(workflow_id)?)
    }

    /// Drop every registration.
    pub fn unregister_all_workflows(&self) -> Result<(), EngineError> {
        Ok(self.registry.unregister_all_workflows()?)
    }

    /// Ensure the run store's schema exists, then start the dispatch
    /// loop and the cron trigger loop.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        self.store.migrate().await?;
        self.dispatcher.start().await?;
        self.cron.start().await?;
        Ok(())
    }

    /// Stop the cron loop, then drain the dispatch loop (waiting up to
    /// `timeout` for in-flight dispatches before aborting).
    #[instrument(skip(self))]
    pub async fn stop(&self, timeout: Duration) {
        self.cron.shutdown().await;
        self.dispatcher.shutdown(timeout).await;
    }

    /// Create a run and enqueue its first dispatch. If `options.idempotency_key`
    /// matches a non-terminal run of the same workflow, that run is
    /// returned unchanged instead.
    #[instrument(skip(self, input), fields(workflow_id))]
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        options: StartWorkflowOptions,
    ) -> Result<WorkflowRun, EngineError> {
        let definition = self
            .registry
            .get(workflow_id)?
            .ok_or_else(|| ValidationError::UnknownWorkflowId(workflow_id.to_string()))?;

        if let Some(validator) = &definition.options().input_schema {
            validator(&input).map_err(|message| ValidationError::InputSchemaRejected {
                workflow_id: workflow_id.to_string(),
                message,
            })?;
        }

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self.store.find_active_by_idempotency_key(workflow_id, key).await? {
                return Ok(existing);
            }
        }

        let max_retries = options
            .max_retries
            .or(definition.options().max_retries)
            .unwrap_or(0);
        let timeout_at = options
            .timeout
            .or(definition.options().timeout)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| chrono::Utc::now() + d);

        let new_run = NewRun {
            workflow_id: workflow_id.to_string(),
            resource_id: None,
            input,
            max_retries,
            idempotency_key: options.idempotency_key,
            timeout_at,
            cron: None,
            timezone: None,
        };

        let run = self.store.insert(new_run).await?;
        self.enqueue_dispatch(&definition, &run, None).await?;
        Ok(run)
    }

    /// Administratively pause a run. Unlike `step.pause`, this isn't a
    /// replay marker the handler parks on — it simply flips the row so
    /// the next dispatch (if one is already in flight) completes its
    /// current step and stops, and no further dispatch is enqueued
    /// until [`Engine::resume_workflow`] is called.
    pub async fn pause_workflow(&self, run_id: RunId, resource_id: Option<&str>) -> Result<WorkflowRun, EngineError> {
        let run = self
            .store
            .update(
                run_id,
                resource_id,
                RunPatch {
                    status: Some(RunStatus::Paused),
                    paused_at: Some(Some(chrono::Utc::now())),
                    ..RunPatch::none()
                },
            )
            .await?;
        Ok(run)
    }

    /// Resume a paused run. Observationally identical to
    /// `triggerEvent` with the engine's reserved internal pause event
    /// name (see [`config::INTERNAL_PAUSE_EVENT`]).
    pub async fn resume_workflow(&self, run_id: RunId, resource_id: Option<&str>) -> Result<WorkflowRun, EngineError> {
        self.trigger_event(run_id, resource_id, config::INTERNAL_PAUSE_EVENT, None).await
    }

    /// Flip a run to `Cancelled`. Cooperative: an in-flight dispatch's
    /// next `step.*` call observes the row and short-circuits, but an
    /// already-running step body isn't interrupted.
    pub async fn cancel_workflow(&self, run_id: RunId, resource_id: Option<&str>) -> Result<WorkflowRun, EngineError> {
        let run = self
            .store
            .update(
                run_id,
                resource_id,
                RunPatch {
                    status: Some(RunStatus::Cancelled),
                    ..RunPatch::none()
                },
            )
            .await?;

        match self.registry.get(&run.workflow_id) {
            Ok(Some(definition)) => {
                definition.hooks().fire_cancel(&run);
                definition.hooks().fire_complete(&run);
            }
            Ok(None) => {
                tracing::warn!(workflow_id = %run.workflow_id, run_id = %run.id, "cancelled a run whose workflow is no longer registered, skipping hooks");
            }
            Err(err) => {
                tracing::warn!(workflow_id = %run.workflow_id, run_id = %run.id, error = %err, "registry lookup failed, skipping cancel hooks");
            }
        }

        Ok(run)
    }

    /// Enqueue one `workflow-run` job carrying `event_name`/`data`,
    /// then return the run's current (pre-dispatch) snapshot.
    pub async fn trigger_event(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
        event_name: &str,
        data: Option<Value>,
    ) -> Result<WorkflowRun, EngineError> {
        let run = self.store.get(run_id, resource_id).await?;
        let definition = self
            .registry
            .get(&run.workflow_id)?
            .ok_or_else(|| ValidationError::UnknownWorkflowId(run.workflow_id.clone()))?;

        let event = serde_json::json!({ "name": event_name, "data": data });
        self.enqueue_dispatch(&definition, &run, Some(event)).await?;
        Ok(run)
    }

    /// Fetch one run, scoped to `resource_id` if supplied.
    pub async fn get_run(&self, run_id: RunId, resource_id: Option<&str>) -> Result<WorkflowRun, EngineError> {
        query_get_run(self.store.as_ref(), run_id, resource_id)
            .await
            .map_err(EngineError::from)
    }

    /// Paginated, filtered listing of runs.
    pub async fn get_runs(&self, filter: ListRunsFilter) -> Result<Page<WorkflowRun>, EngineError> {
        Ok(query_list_runs(self.store.as_ref(), filter).await?)
    }

    /// `checkProgress`: completion percentage against the run's
    /// definition's static step list.
    pub async fn check_progress(&self, run_id: RunId, resource_id: Option<&str>) -> Result<Progress, EngineError> {
        let run = self.get_run(run_id, resource_id).await?;
        let definition = self
            .registry
            .get(&run.workflow_id)?
            .ok_or_else(|| ValidationError::UnknownWorkflowId(run.workflow_id.clone()))?;
        Ok(compute_progress(&run, &definition))
    }

    async fn enqueue_dispatch(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        event: Option<Value>,
    ) -> Result<(), EngineError> {
        let queue_name = if definition.options().needs_dedicated_queue() {
            dedicated_queue_name(definition.id())
        } else {
            engine::SHARED_QUEUE.to_string()
        };
        self.queue.create_queue(&queue_name).await?;

        let payload = serde_json::json!({
            "runId": run.id.to_string(),
            "resourceId": run.resource_id,
            "workflowId": run.workflow_id,
            "input": run.input,
            "event": event,
        });
        self.queue
            .send(
                &queue_name,
                payload,
                SendOptions {
                    start_after: None,
                    expire_in_seconds: Some(
                        definition.options().expire_in_seconds.unwrap_or(self.config.job_expiration_seconds),
                    ),
                },
            )
            .await?;
        Ok(())
    }
}

/// Invoked by [`CronScheduler`] on every tick: create a fresh run of
/// `workflow_id` with `{}` input and route its first dispatch exactly
/// as an API-triggered `startWorkflow` would.
async fn create_cron_run<S: RunStore, Q: QueueAdapter>(
    store: &S,
    queue: &Q,
    registry: &Registry,
    config: &EngineConfig,
    workflow_id: &str,
) -> Result<(), EngineError> {
    let definition = match registry.get(workflow_id)? {
        Some(def) => def,
        None => return Ok(()),
    };
    let cron = match &definition.options().cron {
        Some(cron) => cron.clone(),
        None => return Ok(()),
    };

    let new_run = NewRun {
        workflow_id: workflow_id.to_string(),
        resource_id: None,
        input: serde_json::json!({}),
        max_retries: definition.options().max_retries.unwrap_or(0),
        idempotency_key: None,
        timeout_at: None,
        cron: Some(cron.expression.clone()),
        timezone: Some(cron.timezone.clone()),
    };
    let run = store.insert(new_run).await?;

    let queue_name = if definition.options().needs_dedicated_queue() {
        dedicated_queue_name(definition.id())
    } else {
        engine::SHARED_QUEUE.to_string()
    };
    queue.create_queue(&queue_name).await?;

    let payload = serde_json::json!({
        "runId": run.id.to_string(),
        "resourceId": run.resource_id,
        "workflowId": run.workflow_id,
        "input": run.input,
        "event": Value::Null,
    });
    queue
        .send(
            &queue_name,
            payload,
            SendOptions {
                start_after: None,
                expire_in_seconds: Some(config.job_expiration_seconds),
            },
        )
        .await?;
    Ok(())
}

/// Re-exports for the common case of one store/queue pair.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Hook, Hooks, Middleware, Pipeline, Progress};
    pub use crate::error::{EngineError, NotFoundError, ValidationError};
    pub use crate::id::RunId;
    pub use crate::queue::{InMemoryQueueAdapter, PostgresQueueAdapter, QueueAdapter};
    pub use crate::reliability::RetryPolicy;
    pub use crate::run::{InMemoryRunStore, ListRunsFilter, PostgresRunStore, RunStatus, RunStore, WorkflowRun};
    pub use crate::workflow::{
        ConcurrencyLimit, CronConfig, StepKind, WorkflowContext, WorkflowDefinition, WorkflowError, WorkflowOptions,
    };
    pub use crate::{Engine, StartWorkflowOptions};
}
