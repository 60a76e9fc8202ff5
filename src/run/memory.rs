//! In-memory [`RunStore`] for tests — same semantics as the Postgres
//! implementation, backed by a `tokio::sync::Mutex<HashMap<...>>`
//! instead of a connection pool.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::id::RunId;

use super::model::{RunStatus, WorkflowRun};
use super::store::{ListRunsFilter, NewRun, Page, RunPatch, RunStore, StoreError};

/// In-memory [`RunStore`].
///
/// # Example
///
/// ```
/// use durastep::run::InMemoryRunStore;
///
/// let store = InMemoryRunStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryRunStore {
    rows: Mutex<HashMap<RunId, WorkflowRun>>,
}

impl InMemoryRunStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_patch(run: &mut WorkflowRun, patch: RunPatch) {
    if let Some(status) = patch.status {
        run.status = status;
    }
    if let Some(output) = patch.output {
        run.output = Some(output);
    }
    if let Some(error) = patch.error {
        run.error = error;
    }
    if let Some(step_id) = patch.current_step_id {
        run.current_step_id = Some(step_id);
    }
    for (key, entry) in patch.timeline_merge {
        run.timeline.entry(key).or_insert(entry);
    }
    if let Some(paused_at) = patch.paused_at {
        run.paused_at = paused_at;
    }
    if let Some(resumed_at) = patch.resumed_at {
        run.resumed_at = Some(resumed_at);
    }
    if let Some(completed_at) = patch.completed_at {
        run.completed_at = Some(completed_at);
    }
    if let Some(retry_count) = patch.retry_count {
        run.retry_count = retry_count;
    }
    if let Some(job_id) = patch.job_id {
        run.job_id = Some(job_id);
    }
    run.updated_at = Utc::now();
}

fn scoped<'a>(
    rows: &'a HashMap<RunId, WorkflowRun>,
    run_id: RunId,
    resource_id: Option<&str>,
) -> Result<&'a WorkflowRun, StoreError> {
    let run = rows.get(&run_id).ok_or(StoreError::NotFound(run_id))?;
    if let Some(resource_id) = resource_id {
        if run.resource_id.as_deref() != Some(resource_id) {
            return Err(StoreError::NotFound(run_id));
        }
    }
    Ok(run)
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, new_run: NewRun) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let run = WorkflowRun {
            id: RunId::generate(),
            workflow_id: new_run.workflow_id,
            resource_id: new_run.resource_id,
            status: RunStatus::Running,
            input: new_run.input,
            output: None,
            error: None,
            current_step_id: None,
            timeline: Default::default(),
            created_at: now,
            updated_at: now,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            timeout_at: new_run.timeout_at,
            retry_count: 0,
            max_retries: new_run.max_retries,
            job_id: None,
            cron: new_run.cron,
            timezone: new_run.timezone,
            idempotency_key: new_run.idempotency_key,
        };
        self.rows.lock().await.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
    ) -> Result<WorkflowRun, StoreError> {
        let rows = self.rows.lock().await;
        scoped(&rows, run_id, resource_id).cloned()
    }

    async fn get_last_completed(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|r| r.workflow_id == workflow_id && r.status == RunStatus::Completed)
            .max_by_key(|r| r.completed_at)
            .cloned())
    }

    async fn find_active_by_idempotency_key(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .find(|r| {
                r.workflow_id == workflow_id
                    && r.idempotency_key.as_deref() == Some(key)
                    && !r.status.is_terminal()
            })
            .cloned())
    }

    async fn update(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
        patch: RunPatch,
    ) -> Result<WorkflowRun, StoreError> {
        let mut rows = self.rows.lock().await;
        scoped(&rows, run_id, resource_id)?;
        let run = rows.get_mut(&run_id).expect("checked above");
        apply_patch(run, patch);
        Ok(run.clone())
    }

    async fn with_exclusive(
        &self,
        run_id: RunId,
        resource_id: Option<&str>,
        decide: Box<dyn FnOnce(&WorkflowRun) -> RunPatch + Send>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut rows = self.rows.lock().await;
        scoped(&rows, run_id, resource_id)?;
        let run = rows.get_mut(&run_id).expect("checked above");
        let patch = decide(run);
        apply_patch(run, patch);
        Ok(run.clone())
    }

    async fn list(&self, filter: ListRunsFilter) -> Result<Page<WorkflowRun>, StoreError> {
        let rows = self.rows.lock().await;

        let cursor_created_at = |id: RunId| rows.get(&id).map(|r| r.created_at);
        let after = filter.starting_after.and_then(cursor_created_at);
        let before = filter.ending_before.and_then(cursor_created_at);

        let mut matched: Vec<WorkflowRun> = rows
            .values()
            .filter(|r| {
                filter
                    .resource_id
                    .as_ref()
                    .map_or(true, |rid| r.resource_id.as_deref() == Some(rid.as_str()))
            })
            .filter(|r| {
                filter
                    .workflow_id
                    .as_ref()
                    .map_or(true, |wid| &r.workflow_id == wid)
            })
            .filter(|r| filter.statuses.is_empty() || filter.statuses.contains(&r.status))
            .filter(|r| after.map_or(true, |cursor| r.created_at < cursor))
            .filter(|r| before.map_or(true, |cursor| r.created_at > cursor))
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let limit = filter.clamped_limit() as usize;
        let has_more = matched.len() > limit;
        matched.truncate(limit);

        Ok(Page {
            items: matched,
            has_more,
        })
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
