//! The job queue contract.
//!
//! Treated as an external collaborator: the orchestrator only needs
//! enqueue, delayed enqueue, at-least-once claiming, and cron fan-out.
//! Everything about how the queue achieves delivery guarantees is out
//! of scope for this crate.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Options for [`QueueAdapter::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Delay delivery until this instant; `None` means "as soon as possible".
    pub start_after: Option<DateTime<Utc>>,
    /// Seconds until an unclaimed job expires.
    pub expire_in_seconds: Option<u64>,
}

/// A payload handed to [`QueueAdapter::send`] and later returned by a claim.
#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque id assigned by the adapter.
    pub id: String,
    /// Queue this job was sent to.
    pub queue_name: String,
    /// Opaque payload, round-tripped verbatim.
    pub payload: Value,
    /// Number of times this job has been claimed (1 on first claim).
    pub attempt: u32,
}

/// Options for [`QueueAdapter::work`]'s polling loop.
#[derive(Debug, Clone)]
pub struct WorkOptions {
    /// How often to poll when idle.
    pub polling_interval: Duration,
    /// Maximum jobs claimed per poll.
    pub batch_size: usize,
}

/// Queue transport failures.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The named queue does not exist.
    #[error("queue '{0}' does not exist")]
    UnknownQueue(String),

    /// The cron expression failed to parse.
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] cron::error::Error),

    /// Underlying transport/database failure.
    #[error("queue transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A generic at-least-once job queue with delayed delivery and cron
/// fan-out. The core treats this purely as a transport for "advance
/// this run" signals; queue-level concurrency policy (one queue per
/// concurrency-limited workflow) is layered on top by
/// [`crate::engine::Dispatcher`], not by this trait.
#[async_trait]
pub trait QueueAdapter: Send + Sync + 'static {
    /// Idempotently ensure `name` exists.
    async fn create_queue(&self, name: &str) -> Result<(), QueueError>;

    /// Enqueue `payload`, optionally delayed. At-least-once.
    async fn send(
        &self,
        queue_name: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<String, QueueError>;

    /// Claim up to `batch_size` jobs currently visible on `queue_name`.
    /// Returning normally is an implicit ack of the returned jobs;
    /// callers that want redelivery must call [`QueueAdapter::nack`].
    async fn claim(&self, queue_name: &str, batch_size: usize) -> Result<Vec<Job>, QueueError>;

    /// Acknowledge successful processing of `job_id`.
    async fn ack(&self, queue_name: &str, job_id: &str) -> Result<(), QueueError>;

    /// Return `job_id` to the queue for redelivery.
    async fn nack(&self, queue_name: &str, job_id: &str) -> Result<(), QueueError>;

    /// Register a cron schedule that fires `send(queue_name, payload,
    /// ..)` on every tick, evaluated in `tz`.
    async fn schedule(
        &self,
        queue_name: &str,
        cron_expression: &str,
        payload: Value,
        tz: chrono_tz::Tz,
    ) -> Result<(), QueueError>;

    /// Remove a previously registered cron schedule.
    async fn unschedule(&self, queue_name: &str) -> Result<(), QueueError>;

    /// Drain in-flight workers; idempotent.
    async fn stop(&self) -> Result<(), QueueError>;
}
