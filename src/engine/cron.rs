//! The cron trigger loop.
//!
//! Per §4.6: every cron-bearing definition gets its own queue carrying
//! nothing but tick payloads. `schedule` records the schedule with the
//! queue adapter for visibility/audit, but the tick timing itself is
//! computed here: each workflow's tick loop holds its own parsed
//! `cron::Schedule`, sleeps until `Schedule::upcoming(tz)`'s next fire
//! time, and `send`s the tick payload itself, immediately claiming and
//! acking what it just sent to ask the engine to create a fresh run for
//! that workflow id. The new run's own dispatch job is handed to the
//! engine exactly as an API-triggered `start_workflow` would, which is
//! what routes it onto the shared queue (or the workflow's concurrency
//! queue) instead of back onto this one.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::str::FromStr;

use chrono_tz::Tz;
use cron::Schedule;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::queue::{QueueAdapter, SendOptions};

use super::registry::{Registry, RegistryError};

/// Builds the tick-only queue name for a cron-bearing workflow.
pub fn cron_queue_name(workflow_id: &str) -> String {
    format!("workflow-cron:{workflow_id}")
}

/// Failures starting the cron loop.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// See [`RegistryError`].
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Queue transport failure.
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),

    /// A cron timezone that passed registration somehow fails to parse
    /// here; registration is expected to have already rejected this.
    #[error("unrecognized cron timezone '{0}'")]
    InvalidTimezone(String),

    /// A cron expression that passed registration somehow fails to parse
    /// here; registration is expected to have already rejected this.
    #[error("invalid cron expression '{0}'")]
    InvalidSchedule(String),
}

/// Called once per tick, with the id of the workflow to create a run
/// for. Supplied by [`crate::Engine`], which closes over the store and
/// queue needed to actually perform the creation.
pub type CreateRun = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CronStatus {
    Stopped,
    Running,
}

/// Drives cron-triggered run creation.
pub struct CronScheduler<Q: QueueAdapter> {
    queue: Arc<Q>,
    registry: Arc<Registry>,
    config: EngineConfig,
    create_run: CreateRun,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<CronStatus>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<Q: QueueAdapter> CronScheduler<Q> {
    /// Build a scheduler. `create_run` is invoked with a workflow id on
    /// every tick of that workflow's cron schedule.
    pub fn new(queue: Arc<Q>, registry: Arc<Registry>, config: EngineConfig, create_run: CreateRun) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            queue,
            registry,
            config,
            create_run,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(CronStatus::Stopped),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register every currently-known cron schedule and spawn a tick
    /// worker for each. Call again after registering further
    /// cron-bearing definitions post-start.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), CronError> {
        {
            let mut status = self.status.write().expect("lock poisoned");
            if *status == CronStatus::Running {
                return Ok(());
            }
            *status = CronStatus::Running;
        }

        for def in self.registry.all()? {
            let Some(cron) = def.options().cron.clone() else {
                continue;
            };
            let tz = Tz::from_str(&cron.timezone).map_err(|_| CronError::InvalidTimezone(cron.timezone.clone()))?;
            let schedule = Schedule::from_str(&cron.expression)
                .map_err(|_| CronError::InvalidSchedule(cron.expression.clone()))?;
            let queue_name = cron_queue_name(def.id());

            self.queue.create_queue(&queue_name).await?;
            self.queue
                .schedule(&queue_name, &cron.expression, Value::Null, tz)
                .await?;

            info!(workflow_id = def.id(), expression = %cron.expression, timezone = %cron.timezone, "cron schedule registered");

            let scheduler = Arc::clone(self);
            let workflow_id = def.id().to_string();
            self.handles
                .lock()
                .expect("lock poisoned")
                .push(tokio::spawn(scheduler.tick_loop(queue_name, workflow_id, schedule, tz)));
        }

        Ok(())
    }

    /// Stop every tick worker. Does not unregister schedules from the
    /// queue adapter.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        {
            let mut status = self.status.write().expect("lock poisoned");
            if *status != CronStatus::Running {
                return;
            }
            *status = CronStatus::Stopped;
        }
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().expect("lock poisoned"));
        for handle in handles {
            handle.abort();
        }
    }

    /// Drives one workflow's cron schedule: sleeps until the next fire
    /// time, enqueues a tick, immediately claims and acks it, and asks
    /// the engine to create a run. Ticking is computed here rather than
    /// by the queue adapter, so it behaves identically on the in-memory
    /// and Postgres adapters.
    async fn tick_loop(self: Arc<Self>, queue_name: String, workflow_id: String, schedule: Schedule, tz: Tz) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let Some(next_fire) = schedule.upcoming(tz).next() else {
                warn!(workflow_id = %workflow_id, "cron schedule has no upcoming fire time, stopping tick loop");
                return;
            };
            let delay = (next_fire.with_timezone(&chrono::Utc) - chrono::Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if *shutdown_rx.borrow() {
                return;
            }

            if let Err(err) = self.queue.send(&queue_name, Value::Null, SendOptions::default()).await {
                error!(queue = %queue_name, error = %err, "failed to enqueue cron tick, backing off");
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(self.config.polling_interval) => {}
                }
                continue;
            }

            let jobs = match self.queue.claim(&queue_name, 1).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(queue = %queue_name, error = %err, "cron claim failed");
                    Vec::new()
                }
            };

            for job in jobs {
                (self.create_run)(workflow_id.clone()).await;
                if let Err(err) = self.queue.ack(&queue_name, &job.id).await {
                    warn!(queue = %queue_name, job_id = %job.id, error = %err, "failed to ack cron tick");
                }
            }
        }
    }
}
