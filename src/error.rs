//! Crate-wide error taxonomy.
//!
//! Errors are split by where they surface: [`ValidationError`] and
//! [`NotFoundError`] are returned synchronously from registration and
//! query calls; [`EngineError`] is the umbrella type returned from the
//! public [`crate::Engine`] surface, wrapping the component-level errors
//! (`StoreError`, `QueueError`, `RegistryError`, `DispatchError`).

use crate::engine::{CronError, DispatchError, RegistryError};
use crate::queue::QueueError;
use crate::run::StoreError;

/// Bad registration or bad `start_workflow` input.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// A workflow id was registered twice.
    #[error("workflow '{0}' is already registered")]
    DuplicateWorkflowId(String),

    /// Two steps in the same definition share an id.
    #[error("duplicate step id '{step_id}' in workflow '{workflow_id}'")]
    DuplicateStepId {
        /// Workflow the duplicate was found in.
        workflow_id: String,
        /// The repeated step id.
        step_id: String,
    },

    /// A definition declared no steps.
    #[error("workflow '{0}' has an empty step list")]
    EmptyStepList(String),

    /// The cron expression failed to parse.
    #[error("invalid cron expression '{expression}': {source}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// Underlying parser error.
        #[source]
        source: cron::error::Error,
    },

    /// A cron-bearing workflow's input schema rejects `{}`.
    #[error("workflow '{0}' has a cron schedule but its input type rejects an empty object")]
    CronInputSchemaRejectsEmpty(String),

    /// A cron-bearing workflow named a timezone `chrono-tz` doesn't recognize.
    #[error("workflow '{workflow_id}' has an unrecognized cron timezone '{timezone}'")]
    InvalidTimezone {
        /// Workflow the bad timezone was declared on.
        workflow_id: String,
        /// The offending IANA timezone name.
        timezone: String,
    },

    /// `start_workflow` named an unregistered workflow id.
    #[error("unknown workflow id '{0}'")]
    UnknownWorkflowId(String),

    /// The supplied input failed the workflow's input-schema check.
    #[error("input does not match workflow '{workflow_id}': {message}")]
    InputSchemaRejected {
        /// Workflow the input was submitted against.
        workflow_id: String,
        /// The validator's own rejection message.
        message: String,
    },
}

/// A lookup against a non-existent run, or a run outside the caller's
/// `resource_id` scope.
#[derive(Debug, thiserror::Error)]
#[error("run '{0}' not found")]
pub struct NotFoundError(pub crate::id::RunId);

/// Umbrella error returned from [`crate::Engine`]'s public methods.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// See [`ValidationError`].
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// See [`NotFoundError`].
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    /// Run store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Queue transport failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Dispatch-loop failure (poison job, unregistered workflow at dispatch time).
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Cron loop failure.
    #[error(transparent)]
    Cron(#[from] CronError),
}

impl From<crate::engine::GetRunError> for EngineError {
    fn from(err: crate::engine::GetRunError) -> Self {
        match err {
            crate::engine::GetRunError::NotFound(err) => Self::NotFound(err),
            crate::engine::GetRunError::Store(err) => Self::Store(err),
        }
    }
}
