//! The dispatch loop.
//!
//! One worker pool drains the shared `workflow-run` queue; a
//! concurrency-limited workflow gets its own dedicated dispatch queue
//! and its own single-worker loop instead, so its in-flight dispatch
//! count is bounded by that queue's own claim semantics rather than by
//! anything this struct tracks itself. Cron-triggered workflows also
//! get a dedicated queue, but a separate one carrying only cron ticks
//! (see [`super::cron`]) — the runs those ticks create flow through
//! this dispatch loop exactly like any other, via whichever queue the
//! definition's concurrency setting (if any) names.
//!
//! Each claimed job runs through the same seven steps regardless of
//! which queue it came from: load the run, resolve its schedule
//! context, settle a pending pause against the incoming event (if any),
//! fire `onStart`, run the handler through the middleware pipeline,
//! then reconcile completion or failure against the reloaded row.

use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::id::RunId;
use crate::queue::{Job, QueueAdapter, QueueError, SendOptions};
use crate::run::{RunPatch, RunStatus, RunStore, ScheduleContext, StoreError, TimelineEntry, WorkflowRun};
use crate::workflow::{HandlerExit, StepFacade, WorkflowContext, WorkflowDefinition};

use super::middleware::Pipeline;
use super::registry::{Registry, RegistryError};

/// The queue every dispatch funnels through unless its workflow needs a
/// dedicated one.
pub const SHARED_QUEUE: &str = "workflow-run";

/// Name of the dedicated queue for a concurrency-limited or
/// cron-triggered workflow.
pub fn dedicated_queue_name(workflow_id: &str) -> String {
    format!("workflow-run:{workflow_id}")
}

/// Failures a dispatch can surface. A "poison job" — one referencing a
/// run or workflow id that no longer (or never did) exist — is acked
/// rather than retried; there is nothing a redelivery could fix.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Job payload failed to deserialize.
    #[error("malformed job payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Run store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Queue transport failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobPayload {
    run_id: RunId,
    #[serde(default)]
    resource_id: Option<String>,
    #[allow(dead_code)]
    workflow_id: String,
    #[serde(default)]
    event: Option<EventPayload>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventPayload {
    name: String,
    data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatcherStatus {
    Stopped,
    Running,
    Draining,
}

/// Drives registered workflows' runs to completion.
pub struct Dispatcher<S: RunStore, Q: QueueAdapter> {
    store: Arc<S>,
    queue: Arc<Q>,
    registry: Arc<Registry>,
    config: EngineConfig,
    pipeline: Pipeline,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    active_jobs: Arc<Semaphore>,
    worker_count: RwLock<usize>,
    status: RwLock<DispatcherStatus>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: RunStore, Q: QueueAdapter> Dispatcher<S, Q> {
    /// Build a dispatcher. Call [`Dispatcher::start`] to begin polling.
    pub fn new(store: Arc<S>, queue: Arc<Q>, registry: Arc<Registry>, config: EngineConfig, pipeline: Pipeline) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            queue,
            registry,
            config,
            pipeline,
            shutdown_tx,
            shutdown_rx,
            active_jobs: Arc::new(Semaphore::new(0)),
            worker_count: RwLock::new(0),
            status: RwLock::new(DispatcherStatus::Stopped),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create the shared queue plus one dedicated queue per
    /// concurrency-limited or cron-triggered registered workflow, and
    /// spawn a worker loop over each.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), DispatchError> {
        {
            let mut status = self.status.write().expect("lock poisoned");
            if *status == DispatcherStatus::Running {
                return Ok(());
            }
            *status = DispatcherStatus::Running;
        }

        self.queue.create_queue(SHARED_QUEUE).await?;

        let dedicated: Vec<Arc<WorkflowDefinition>> = self
            .registry
            .all()?
            .into_iter()
            .filter(|def| def.options().needs_dedicated_queue())
            .collect();

        let dedicated_worker_counts: Vec<usize> = dedicated
            .iter()
            .map(|def| {
                def.options()
                    .concurrency
                    .map(|c| c.limit.max(1) as usize)
                    .unwrap_or(1)
            })
            .collect();
        let total_workers = self.config.worker_count + dedicated_worker_counts.iter().sum::<usize>();
        *self.worker_count.write().expect("lock poisoned") = total_workers;
        self.active_jobs.add_permits(total_workers);

        let mut handles = self.handles.lock().expect("lock poisoned");
        for _ in 0..self.config.worker_count {
            let dispatcher = Arc::clone(self);
            handles.push(tokio::spawn(dispatcher.worker_loop(SHARED_QUEUE.to_string())));
        }
        // A concurrency-limited workflow's dedicated queue gets `limit`
        // worker loops instead of one, so its effective in-flight cap
        // tracks the declared limit rather than always being 1.
        for (def, worker_count) in dedicated.into_iter().zip(dedicated_worker_counts) {
            let queue_name = dedicated_queue_name(def.id());
            self.queue.create_queue(&queue_name).await?;
            for _ in 0..worker_count {
                let dispatcher = Arc::clone(self);
                handles.push(tokio::spawn(dispatcher.worker_loop(queue_name.clone())));
            }
        }

        info!(worker_count = total_workers, "dispatcher started");
        Ok(())
    }

    /// Signal every worker loop to stop claiming new jobs, then wait
    /// (up to `timeout`) for in-flight dispatches to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: StdDuration) {
        {
            let mut status = self.status.write().expect("lock poisoned");
            if *status != DispatcherStatus::Running {
                return;
            }
            *status = DispatcherStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);

        let total = *self.worker_count.read().expect("lock poisoned");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_jobs.available_permits() >= total {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("dispatcher shutdown timed out waiting for in-flight dispatches");
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().expect("lock poisoned"));
        for handle in handles {
            handle.abort();
        }
        *self.status.write().expect("lock poisoned") = DispatcherStatus::Stopped;
        info!("dispatcher stopped");
    }

    async fn worker_loop(self: Arc<Self>, queue_name: String) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let claimed = tokio::select! {
                _ = shutdown_rx.changed() => return,
                result = self.queue.claim(&queue_name, self.config.batch_size) => result,
            };

            let jobs = match claimed {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(queue = %queue_name, error = %err, "claim failed, backing off");
                    Vec::new()
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(self.config.polling_interval) => {}
                }
                continue;
            }

            for job in jobs {
                let _permit = self.active_jobs.acquire().await.expect("semaphore never closed");
                if let Err(err) = self.dispatch_job(&queue_name, &job).await {
                    error!(queue = %queue_name, job_id = %job.id, error = %err, "dispatch failed");
                }
            }
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %queue_name))]
    async fn dispatch_job(&self, queue_name: &str, job: &Job) -> Result<(), DispatchError> {
        let payload: JobPayload = serde_json::from_value(job.payload.clone())?;

        let run = match self.store.get(payload.run_id, payload.resource_id.as_deref()).await {
            Ok(run) => run,
            Err(StoreError::NotFound(_)) => {
                warn!(run_id = %payload.run_id, "poison job: run no longer exists, acking");
                self.queue.ack(queue_name, &job.id).await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if run.status == RunStatus::Cancelled {
            self.queue.ack(queue_name, &job.id).await?;
            return Ok(());
        }

        let definition = match self.registry.get(&run.workflow_id)? {
            Some(def) => def,
            None => {
                warn!(workflow_id = %run.workflow_id, "poison job: workflow no longer registered, acking");
                self.queue.ack(queue_name, &job.id).await?;
                return Ok(());
            }
        };

        let schedule = if run.cron.is_some() {
            let last = self.store.get_last_completed(&run.workflow_id).await?;
            Some(ScheduleContext {
                timestamp: run.created_at,
                last_timestamp: last.and_then(|r| r.completed_at),
                timezone: run.timezone.clone().unwrap_or_else(|| "UTC".to_string()),
            })
        } else {
            None
        };

        let run = if run.status == RunStatus::Paused {
            self.settle_pause(&run, payload.event).await?
        } else {
            run
        };

        if run.retry_count == 0 {
            definition.hooks().fire_start(&run);
        }

        let resume_queue = if definition.options().needs_dedicated_queue() {
            dedicated_queue_name(&run.workflow_id)
        } else {
            SHARED_QUEUE.to_string()
        };
        let step = StepFacade::new(
            self.store.clone() as Arc<dyn RunStore>,
            self.queue.clone() as Arc<dyn QueueAdapter>,
            run.id,
            run.resource_id.clone(),
            resume_queue,
        );
        let ctx = WorkflowContext::new(run.id, run.resource_id.clone(), run.input.clone(), schedule, step);

        let handler = {
            let definition = definition.clone();
            move |ctx: WorkflowContext| definition.invoke(ctx)
        };
        let outcome = self.pipeline.run(ctx, &handler).await;

        match outcome {
            Err(HandlerExit::Failed(err)) => {
                self.handle_failure(queue_name, job, &run, &definition, err).await
            }
            Ok(value) => self.reconcile_completion(queue_name, job, &run, &definition, Some(value)).await,
            Err(HandlerExit::Suspended) => self.reconcile_completion(queue_name, job, &run, &definition, None).await,
        }
    }

    async fn settle_pause(&self, run: &WorkflowRun, event: Option<EventPayload>) -> Result<WorkflowRun, DispatchError> {
        let marker_step = run.current_step_id.clone();
        let result = self
            .store
            .with_exclusive(
                run.id,
                run.resource_id.as_deref(),
                Box::new(move |current| {
                    let matched_step: Option<String> = match (&marker_step, &event) {
                        (Some(step_id), Some(ev)) => {
                            let marker_matches = current
                                .wait_for_marker(step_id)
                                .map(|m| m.event_name == ev.name)
                                .unwrap_or(false);
                            marker_matches.then(|| step_id.clone())
                        }
                        _ => None,
                    };

                    match matched_step {
                        Some(step_id) => {
                            let output = event.as_ref().and_then(|e| e.data.clone()).unwrap_or_else(|| serde_json::json!({}));
                            RunPatch {
                                status: Some(RunStatus::Running),
                                paused_at: Some(None),
                                resumed_at: Some(Utc::now()),
                                timeline_merge: [(
                                    step_id.clone(),
                                    TimelineEntry::Output {
                                        output,
                                        timestamp: Utc::now(),
                                    },
                                )]
                                .into_iter()
                                .collect(),
                                ..RunPatch::none()
                            }
                        }
                        None => RunPatch {
                            status: Some(RunStatus::Running),
                            resumed_at: Some(Utc::now()),
                            ..RunPatch::none()
                        },
                    }
                }),
            )
            .await?;
        Ok(result)
    }

    async fn reconcile_completion(
        &self,
        queue_name: &str,
        job: &Job,
        run: &WorkflowRun,
        definition: &Arc<WorkflowDefinition>,
        handler_output: Option<Value>,
    ) -> Result<(), DispatchError> {
        let reloaded = self.store.get(run.id, run.resource_id.as_deref()).await?;
        let last_step = definition.last_step_id();

        if reloaded.status == RunStatus::Running && last_step.is_some() && reloaded.current_step_id.as_deref() == last_step {
            let completed = self
                .store
                .update(
                    reloaded.id,
                    reloaded.resource_id.as_deref(),
                    RunPatch {
                        status: Some(RunStatus::Completed),
                        output: Some(handler_output.unwrap_or(Value::Null)),
                        completed_at: Some(Utc::now()),
                        ..RunPatch::none()
                    },
                )
                .await?;
            definition.hooks().fire_success(&completed);
            definition.hooks().fire_complete(&completed);
        }

        self.queue.ack(queue_name, &job.id).await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        queue_name: &str,
        job: &Job,
        run: &WorkflowRun,
        definition: &Arc<WorkflowDefinition>,
        err: crate::workflow::WorkflowError,
    ) -> Result<(), DispatchError> {
        let reloaded = self.store.get(run.id, run.resource_id.as_deref()).await?;

        if err.retryable && reloaded.retry_count < reloaded.max_retries {
            let policy = definition.options().retry.clone().unwrap_or_default();
            let delay = policy.delay_for_retry(reloaded.retry_count);
            let new_retry_count = reloaded.retry_count + 1;

            self.store
                .update(
                    reloaded.id,
                    reloaded.resource_id.as_deref(),
                    RunPatch {
                        status: Some(RunStatus::Running),
                        error: Some(None),
                        retry_count: Some(new_retry_count),
                        ..RunPatch::none()
                    },
                )
                .await?;

            let start_after = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
            let resume_payload = serde_json::json!({
                "runId": reloaded.id.to_string(),
                "resourceId": reloaded.resource_id,
                "workflowId": reloaded.workflow_id,
            });
            self.queue
                .send(
                    queue_name,
                    resume_payload,
                    SendOptions {
                        start_after: Some(start_after),
                        expire_in_seconds: Some(self.config.job_expiration_seconds),
                    },
                )
                .await?;
        } else {
            let failed = self
                .store
                .update(
                    reloaded.id,
                    reloaded.resource_id.as_deref(),
                    RunPatch {
                        status: Some(RunStatus::Failed),
                        error: Some(Some(err.message.clone())),
                        ..RunPatch::none()
                    },
                )
                .await?;
            definition.hooks().fire_failure(&failed);
            definition.hooks().fire_complete(&failed);
        }

        self.queue.ack(queue_name, &job.id).await?;
        Ok(())
    }
}
