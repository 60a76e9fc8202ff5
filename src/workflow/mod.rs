//! Workflow definitions and the handler-facing context.
//!
//! - [`WorkflowDefinition`] is the static, registered record of a
//!   handler, its step list, and its options.
//! - [`WorkflowContext`] and [`StepFacade`] are what a handler actually
//!   sees and calls (`ctx.step.run`/`waitFor`/`pause`/`waitUntil`).

mod context;
mod definition;
mod options;

pub use context::{HandlerExit, StepFacade, StepResult, WorkflowContext, WorkflowError};
pub use definition::{Handler, HandlerFuture, StepKind, StepSpec, WorkflowDefinition, WorkflowDefinitionBuilder};
pub use options::{ConcurrencyLimit, CronConfig, WorkflowOptions};
