//! The persisted run record and its timeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::RunId;

/// Lifecycle states of a [`WorkflowRun`].
///
/// Transitions: `Pending? -> Running -> (Paused <-> Running)* ->
/// (Completed | Failed | Cancelled)`. `Cancelled` is terminal
/// unconditionally; `Failed` is terminal only once `retry_count >=
/// max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Row written, not yet picked up by a dispatcher.
    Pending,
    /// A dispatcher currently owns this run's handler.
    Running,
    /// Parked on a `waitFor`/`pause`/`waitUntil` marker.
    Paused,
    /// Handler reached the last static step and returned.
    Completed,
    /// Retries exhausted (or `retries: 0` and the first attempt failed).
    Failed,
    /// Cancelled by the caller. Terminal, never overwritten.
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses are never revisited by a later dispatch.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One entry in a run's timeline, keyed by step id (or `"<id>-wait-for"`
/// for a pause marker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimelineEntry {
    /// A `run`/`waitFor`/`waitUntil` step's cached, write-once result.
    Output {
        /// The cached value. Step bodies that return nothing are
        /// normalized to `{}` so "present but empty" and "absent" stay
        /// distinguishable.
        output: Value,
        /// When this entry was written.
        timestamp: DateTime<Utc>,
    },
    /// A pause marker, stored under `"<stepId>-wait-for"`.
    WaitFor {
        /// The event/timeout this step is parked on.
        wait_for: WaitForMarker,
        /// When the run entered `Paused` on this step.
        timestamp: DateTime<Utc>,
    },
}

/// The event name (and optional advisory timeout) a paused run is
/// waiting to be matched against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForMarker {
    /// Name of the event that will unpause this run.
    pub event_name: String,
    /// Advisory-only deadline; not enforced by this crate (see
    /// Design Notes / Open Questions).
    pub timeout_ms: Option<u64>,
}

/// A run's full timeline, keyed by step id (or the derived
/// `"<id>-wait-for"` key for pause markers).
pub type Timeline = HashMap<String, TimelineEntry>;

/// Derives the wait-for marker key for a step id.
pub fn wait_for_key(step_id: &str) -> String {
    format!("{step_id}-wait-for")
}

/// Context handed to cron-triggered runs; `None` for API-triggered runs,
/// which is how the read path distinguishes the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleContext {
    /// This run's own `created_at`.
    pub timestamp: DateTime<Utc>,
    /// `completed_at` of the previous `Completed` run of this workflow,
    /// if any.
    pub last_timestamp: Option<DateTime<Utc>>,
    /// IANA timezone the cron expression is evaluated in.
    pub timezone: String,
}

/// A persisted workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Sortable, externally visible identifier.
    pub id: RunId,
    /// Id of the [`crate::workflow::WorkflowDefinition`] this run executes.
    pub workflow_id: String,
    /// Opaque tenant/entity scope, never interpreted by the engine.
    pub resource_id: Option<String>,
    /// Current lifecycle state.
    pub status: RunStatus,
    /// Opaque input JSON supplied at creation.
    pub input: Value,
    /// Opaque output JSON; `None` until `Completed`.
    pub output: Option<Value>,
    /// Failure message; `None` unless `Failed`.
    pub error: Option<String>,
    /// Id of the step the handler most recently advanced to.
    pub current_step_id: Option<String>,
    /// Cached step results and pause markers.
    pub timeline: Timeline,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
    /// Bumped on every mutation.
    pub updated_at: DateTime<Utc>,
    /// Set when entering `Paused`, cleared on resume.
    pub paused_at: Option<DateTime<Utc>>,
    /// Set when leaving `Paused`.
    pub resumed_at: Option<DateTime<Utc>>,
    /// Set when entering `Completed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Advisory deadline; persisted, not enforced (see Design Notes).
    pub timeout_at: Option<DateTime<Utc>>,
    /// Number of handler-level failures so far.
    pub retry_count: u32,
    /// Ceiling on `retry_count` before `Failed` becomes terminal.
    pub max_retries: u32,
    /// Last queue job id that advanced this run, for observability.
    pub job_id: Option<String>,
    /// Cron expression, set only on cron-triggered runs.
    pub cron: Option<String>,
    /// Timezone paired with `cron`.
    pub timezone: Option<String>,
    /// De-duplication key; see `(workflow_id, idempotency_key)` index.
    pub idempotency_key: Option<String>,
}

impl WorkflowRun {
    /// Read the cached output for `step_id`, if any.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        match self.timeline.get(step_id) {
            Some(TimelineEntry::Output { output, .. }) => Some(output),
            _ => None,
        }
    }

    /// Read the wait-for marker for `step_id`, if the run is parked there.
    pub fn wait_for_marker(&self, step_id: &str) -> Option<&WaitForMarker> {
        match self.timeline.get(&wait_for_key(step_id)) {
            Some(TimelineEntry::WaitFor { wait_for, .. }) => Some(wait_for),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&RunStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
    }

    #[test]
    fn wait_for_key_derivation() {
        assert_eq!(wait_for_key("s2"), "s2-wait-for");
    }
}
