//! Workflow definitions: the in-memory, immutable-once-registered
//! record of a handler, its static step list, and its options.
//!
//! The static step list is an explicit registration argument rather
//! than recovered by parsing the handler's source (see Design Notes /
//! Open Questions: handler source analysis is deliberately not
//! reimplemented here).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::context::{HandlerExit, WorkflowContext};
use super::options::WorkflowOptions;
use crate::engine::Hooks;

/// A step's behavior, as declared at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Performs work via `step.run`.
    Run,
    /// Waits for a named external event via `step.waitFor`.
    WaitFor,
    /// Waits for manual resume via `step.pause`.
    Pause,
    /// Waits until a wall-clock instant via `step.waitUntil`.
    WaitUntil,
}

/// One entry in a [`WorkflowDefinition`]'s static step list.
#[derive(Debug, Clone)]
pub struct StepSpec {
    /// The step id the handler will call `step.*` with.
    pub id: String,
    /// What kind of step this is.
    pub kind: StepKind,
}

/// A boxed, type-erased async handler body.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerExit>> + Send>>;

/// A user-supplied handler: given a [`WorkflowContext`], run to
/// completion or to a suspension point.
pub type Handler = Arc<dyn Fn(WorkflowContext) -> HandlerFuture + Send + Sync>;

/// An immutable, registered workflow definition.
#[derive(Clone)]
pub struct WorkflowDefinition {
    id: String,
    handler: Handler,
    steps: Vec<StepSpec>,
    options: WorkflowOptions,
    hooks: Hooks,
}

impl WorkflowDefinition {
    /// Start building a definition for `id`.
    pub fn builder(id: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            id: id.into(),
            steps: Vec::new(),
            options: WorkflowOptions::default(),
            hooks: Hooks::default(),
        }
    }

    /// The definition's unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The static, ordered step list.
    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    /// Id of the last step in the static list, used by the dispatcher
    /// to decide whether a dispatch reached the end of the handler.
    pub fn last_step_id(&self) -> Option<&str> {
        self.steps.last().map(|s| s.id.as_str())
    }

    /// This definition's options.
    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    /// This definition's lifecycle hooks.
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Invoke the handler against `ctx`.
    pub fn invoke(&self, ctx: WorkflowContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("steps", &self.steps)
            .field("options", &self.options)
            .finish()
    }
}

/// Builder for [`WorkflowDefinition`].
///
/// # Example
///
/// ```ignore
/// use durastep::workflow::{WorkflowDefinition, StepKind};
/// use serde_json::json;
///
/// let def = WorkflowDefinition::builder("greet")
///     .step("a", StepKind::Run)
///     .handler(|ctx| Box::pin(async move {
///         let out = ctx.step.run("a", || async { Ok(json!({"n": 7})) }).await?;
///         Ok(out)
///     }));
/// ```
pub struct WorkflowDefinitionBuilder {
    id: String,
    steps: Vec<StepSpec>,
    options: WorkflowOptions,
    hooks: Hooks,
}

impl WorkflowDefinitionBuilder {
    /// Append a step to the static step list, in call order.
    pub fn step(mut self, id: impl Into<String>, kind: StepKind) -> Self {
        self.steps.push(StepSpec {
            id: id.into(),
            kind,
        });
        self
    }

    /// Set the workflow's options (retries, concurrency, cron, timeout).
    pub fn options(mut self, options: WorkflowOptions) -> Self {
        self.options = options;
        self
    }

    /// Set lifecycle hooks.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Finish, supplying the handler body.
    pub fn handler<F>(self, handler: F) -> WorkflowDefinition
    where
        F: Fn(WorkflowContext) -> HandlerFuture + Send + Sync + 'static,
    {
        WorkflowDefinition {
            id: self.id,
            handler: Arc::new(handler),
            steps: self.steps,
            options: self.options,
            hooks: self.hooks,
        }
    }
}
