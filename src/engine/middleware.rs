//! The middleware pipeline the dispatcher runs a handler invocation
//! through.
//!
//! Registered in call order; each middleware runs before the handler
//! (and everything after it) in registration order, and after it in
//! reverse. A middleware that never calls `next` suppresses the
//! handler (and any middleware registered after it) entirely — its own
//! returned value stands in for the handler's.

use std::sync::Arc;

use crate::workflow::{HandlerFuture, WorkflowContext};

/// The remaining pipeline, callable once.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    tail: &'a (dyn Fn(WorkflowContext) -> HandlerFuture + Send + Sync),
}

impl<'a> Next<'a> {
    /// Invoke the next middleware (or, once the chain is exhausted,
    /// the handler itself).
    pub fn call(self, ctx: WorkflowContext) -> HandlerFuture {
        match self.middlewares.split_first() {
            Some((head, rest)) => head.handle(
                ctx,
                Next {
                    middlewares: rest,
                    tail: self.tail,
                },
            ),
            None => (self.tail)(ctx),
        }
    }
}

/// One middleware stage.
pub trait Middleware: Send + Sync {
    /// Observe/modify `ctx`, then either call `next.call(ctx)` to
    /// continue the chain or return a value directly to suppress it.
    fn handle(&self, ctx: WorkflowContext, next: Next<'_>) -> HandlerFuture;
}

/// An ordered stack of middleware, with the eventual handler call at
/// its tail.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// An empty pipeline (just the handler).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware, to run innermost-last.
    pub fn push(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Run `ctx` through every middleware, then `handler`.
    pub fn run(
        &self,
        ctx: WorkflowContext,
        handler: &(dyn Fn(WorkflowContext) -> HandlerFuture + Send + Sync),
    ) -> HandlerFuture {
        Next {
            middlewares: &self.middlewares,
            tail: handler,
        }
        .call(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueueAdapter;
    use crate::run::InMemoryRunStore;
    use crate::workflow::{HandlerExit, StepFacade};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl Middleware for Counting {
        fn handle(&self, ctx: WorkflowContext, next: Next<'_>) -> HandlerFuture {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.call(ctx)
        }
    }

    struct Suppressing;

    impl Middleware for Suppressing {
        fn handle(&self, _ctx: WorkflowContext, _next: Next<'_>) -> HandlerFuture {
            Box::pin(async { Err(HandlerExit::Suspended) })
        }
    }

    fn sample_ctx() -> WorkflowContext {
        let store = Arc::new(InMemoryRunStore::new());
        let queue = Arc::new(InMemoryQueueAdapter::new());
        let step = StepFacade::new(store, queue, crate::id::RunId::generate(), None, "workflow-run".into());
        WorkflowContext::new(crate::id::RunId::generate(), None, serde_json::json!({}), None, step)
    }

    #[tokio::test]
    async fn middlewares_run_in_registration_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());

        struct Tagging(Arc<std::sync::Mutex<Vec<&'static str>>>, &'static str);
        impl Middleware for Tagging {
            fn handle(&self, ctx: WorkflowContext, next: Next<'_>) -> HandlerFuture {
                self.0.lock().unwrap().push(self.1);
                next.call(ctx)
            }
        }

        let pipeline = Pipeline::new()
            .push(Arc::new(Tagging(o1, "first")))
            .push(Arc::new(Tagging(o2, "second")))
            .push(Arc::new(Counting(counter.clone())));

        let handler = |_ctx: WorkflowContext| -> HandlerFuture {
            Box::pin(async { Ok(serde_json::json!({"ran": true})) })
        };

        let result = pipeline.run(sample_ctx(), &handler).await;
        assert_eq!(result.unwrap(), serde_json::json!({"ran": true}));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn a_suppressing_middleware_short_circuits_the_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new()
            .push(Arc::new(Suppressing))
            .push(Arc::new(Counting(counter.clone())));

        let handler =
            |_ctx: WorkflowContext| -> HandlerFuture { Box::pin(async { Ok(serde_json::json!({})) }) };

        let result = pipeline.run(sample_ctx(), &handler).await;
        assert!(matches!(result, Err(HandlerExit::Suspended)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
