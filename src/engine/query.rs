//! The read path: `getRun`/`getRuns`/`checkProgress`.

use serde::Serialize;

use crate::error::NotFoundError;
use crate::id::RunId;
use crate::run::{ListRunsFilter, Page, RunStatus, RunStore, StoreError, WorkflowRun};
use crate::workflow::WorkflowDefinition;

/// `checkProgress`'s response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// 0-100. Always exactly 100 when the run is `Completed`.
    pub completion_percentage: u32,
    /// Length of the definition's static step list.
    pub total_steps: usize,
    /// Number of those steps with a cached output in the run's timeline.
    pub completed_steps: usize,
}

/// Compute `checkProgress` for `run` against its definition's static
/// step list. `completion_percentage == 100` iff `run.status ==
/// RunStatus::Completed` — a handler can reach its last step without
/// having called every declared step along a particular control-flow
/// path, so the raw ratio alone can't be trusted to hit 100 exactly.
pub fn progress(run: &WorkflowRun, definition: &WorkflowDefinition) -> Progress {
    let total_steps = definition.steps().len();
    let completed_steps = definition
        .steps()
        .iter()
        .filter(|step| run.step_output(&step.id).is_some())
        .count();

    let completion_percentage = if run.status == RunStatus::Completed {
        100
    } else if total_steps == 0 {
        0
    } else {
        ((completed_steps as f64 / total_steps as f64) * 100.0).round() as u32
    };

    Progress {
        completion_percentage,
        total_steps,
        completed_steps,
    }
}

/// Failures from [`get_run`].
#[derive(Debug, thiserror::Error)]
pub enum GetRunError {
    /// No such run, or it exists outside the caller's `resource_id` scope.
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `getRun`: fetch one run, translating a missing or mis-scoped row
/// into [`NotFoundError`] instead of the store's raw `StoreError`.
pub async fn get_run<S: RunStore>(
    store: &S,
    run_id: RunId,
    resource_id: Option<&str>,
) -> Result<WorkflowRun, GetRunError> {
    match store.get(run_id, resource_id).await {
        Ok(run) => Ok(run),
        Err(StoreError::NotFound(id)) => Err(GetRunError::NotFound(NotFoundError(id))),
        Err(err) => Err(GetRunError::Store(err)),
    }
}

/// `getRuns`: paginated, filtered listing.
pub async fn list_runs<S: RunStore>(store: &S, filter: ListRunsFilter) -> Result<Page<WorkflowRun>, StoreError> {
    store.list(filter).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepKind;

    fn definition_with_steps(ids: &[&str]) -> WorkflowDefinition {
        let mut builder = WorkflowDefinition::builder("w");
        for id in ids {
            builder = builder.step(*id, StepKind::Run);
        }
        builder.handler(|ctx| Box::pin(async move { Ok(ctx.input) }))
    }

    fn sample_run(status: RunStatus) -> WorkflowRun {
        let now = chrono::Utc::now();
        WorkflowRun {
            id: crate::id::RunId::generate(),
            workflow_id: "w".into(),
            resource_id: None,
            status,
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
    fn halfway_through_a_two_step_run_is_fifty_percent() {
        let def = definition_with_steps(&["a", "b"]);
        let mut run = sample_run(RunStatus::Paused);
        run.timeline.insert(
            "a".into(),
            crate::run::TimelineEntry::Output {
                output: serde_json::json!("r1"),
                timestamp: chrono::Utc::now(),
            },
        );
        let p = progress(&run, &def);
        assert_eq!(p.total_steps, 2);
        assert_eq!(p.completed_steps, 1);
        assert_eq!(p.completion_percentage, 50);
    }

    #[test]
    fn completed_run_is_always_one_hundred_percent() {
        let def = definition_with_steps(&["a"]);
        let run = sample_run(RunStatus::Completed);
        assert_eq!(progress(&run, &def).completion_percentage, 100);
    }

    #[test]
    fn fresh_run_is_zero_percent() {
        let def = definition_with_steps(&["a"]);
        let run = sample_run(RunStatus::Running);
        assert_eq!(progress(&run, &def).completion_percentage, 0);
    }
}
