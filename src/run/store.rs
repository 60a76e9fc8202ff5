//! The run store contract.
//!
//! Unlike a design that hands transaction handles across the trait
//! boundary (not object-safe, and awkward across a `Send`-bound async
//! trait), every mutation this crate needs is expressed as a single
//! atomic store operation. [`RunStore::with_exclusive`] is the one that
//! matters most: it is the store-side half of `step.run`/`waitFor` —
//! open a transaction, take the row lock, hand the *current* row to a
//! caller-supplied closure, apply the [`RunPatch`] it returns, commit.
//! This keeps the lock's lifetime entirely inside the store
//! implementation, the same shape the donor crate uses for
//! `claim_task`/`complete_task`/`fail_task`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::id::RunId;

use super::model::{RunStatus, Timeline, WorkflowRun};

/// Store-level failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No row for this id (or a `resource_id` mismatch).
    #[error("run {0} not found")]
    NotFound(RunId),

    /// The `(workflow_id, idempotency_key)` unique constraint fired.
    #[error("run with idempotency key '{0}' already exists and is active")]
    IdempotencyConflict(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Input to [`RunStore::insert`].
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Id of the definition this run executes.
    pub workflow_id: String,
    /// Opaque tenant/entity scope.
    pub resource_id: Option<String>,
    /// Opaque input JSON.
    pub input: Value,
    /// Retry ceiling for this run (from workflow options or per-call override).
    pub max_retries: u32,
    /// Idempotency de-duplication key, if supplied.
    pub idempotency_key: Option<String>,
    /// Workflow-level timeout, materialized into `timeout_at`.
    pub timeout_at: Option<DateTime<Utc>>,
    /// Cron expression, set only for cron-triggered runs.
    pub cron: Option<String>,
    /// Timezone, paired with `cron`.
    pub timezone: Option<String>,
}

/// A partial update applied by [`RunStore::with_exclusive`] or
/// [`RunStore::update`]. `None` means "leave unchanged"; `paused_at` is
/// the one field that must be explicitly clearable, so it is
/// double-`Option`.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    /// New status, if changing.
    pub status: Option<RunStatus>,
    /// New output, if the run just completed.
    pub output: Option<Value>,
    /// `Some(Some(msg))` sets `error`; `Some(None)` clears it (e.g. when
    /// a failed dispatch is put back to `Running` for a retry).
    pub error: Option<Option<String>>,
    /// New `current_step_id`, if the handler advanced.
    pub current_step_id: Option<String>,
    /// Timeline entries to merge in (write-once keys only).
    pub timeline_merge: Timeline,
    /// `Some(Some(t))` sets `paused_at`; `Some(None)` clears it.
    pub paused_at: Option<Option<DateTime<Utc>>>,
    /// New `resumed_at`.
    pub resumed_at: Option<DateTime<Utc>>,
    /// New `completed_at`.
    pub completed_at: Option<DateTime<Utc>>,
    /// New `retry_count`.
    pub retry_count: Option<u32>,
    /// New `job_id`, for observability.
    pub job_id: Option<String>,
}

impl RunPatch {
    /// A patch that changes nothing (still bumps `updated_at`).
    pub fn none() -> Self {
        Self::default()
    }
}

/// Filter/pagination input to [`RunStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListRunsFilter {
    /// Restrict to one tenant/entity scope.
    pub resource_id: Option<String>,
    /// Restrict to one workflow definition.
    pub workflow_id: Option<String>,
    /// Restrict to these statuses; empty means "any".
    pub statuses: Vec<RunStatus>,
    /// Page size, clamped to `[1, 100]`.
    pub limit: u32,
    /// Opaque cursor: return rows created strictly after this run's `created_at`.
    pub starting_after: Option<RunId>,
    /// Opaque cursor: return rows created strictly before this run's `created_at`.
    pub ending_before: Option<RunId>,
}

impl ListRunsFilter {
    /// Clamp `limit` into `[1, 100]`, the store's public contract.
    pub fn clamped_limit(&self) -> u32 {
        self.limit.clamp(1, 100)
    }
}

/// One page of [`WorkflowRun`]s.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The rows, at most `limit` of them.
    pub items: Vec<T>,
    /// Whether a further page exists.
    pub has_more: bool,
}

/// CRUD and locking over run rows.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Allocate a sortable id, write the row at `status = Running` with
    /// an empty timeline and `retry_count = 0`.
    async fn insert(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError>;

    /// Fetch a row, scoped to `resource_id` if supplied.
    async fn get(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
    ) -> Result<WorkflowRun, StoreError>;

    /// Most recent `Completed` run of `workflow_id`, for `ScheduleContext`.
    async fn get_last_completed(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRun>, StoreError>;

    /// A non-terminal run already carrying `(workflow_id, key)`, if any.
    async fn find_active_by_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> Result<Option<WorkflowRun>, StoreError>;

    /// Apply `patch` unconditionally; always bumps `updated_at`.
    async fn update(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
        patch: RunPatch,
    ) -> Result<WorkflowRun, StoreError>;

    /// Take an exclusive row lock, hand the current row to `decide`, and
    /// atomically apply the patch it returns within the same
    /// transaction the lock was taken in.
    async fn with_exclusive(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
        decide: Box<dyn FnOnce(&WorkflowRun) -> RunPatch + Send>,
    ) -> Result<WorkflowRun, StoreError>;

    /// Paginated, filtered listing ordered by `created_at DESC`.
    async fn list(&self, filter: ListRunsFilter) -> Result<Page<WorkflowRun>, StoreError>;

    /// Idempotently ensure the schema (table + indexes) exists,
    /// additively applying any columns/indexes a pre-existing table
    /// predates. Never drops or renames.
    async fn migrate(&self) -> Result<(), StoreError>;
}
