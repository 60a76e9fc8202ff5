//! End-to-end scenarios against an all-in-memory `Engine`: a run's full
//! lifecycle through the dispatcher and cron loop, without a database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use durastep::prelude::*;
use durastep::{Engine, StartWorkflowOptions};

fn fast_config() -> EngineConfig {
    EngineConfig::new()
        .with_worker_count(2)
        .with_polling_interval(Duration::from_millis(10))
        .with_batch_size(4)
}

fn test_engine() -> Engine<InMemoryRunStore, InMemoryQueueAdapter> {
    Engine::new(
        Arc::new(InMemoryRunStore::new()),
        Arc::new(InMemoryQueueAdapter::new()),
        fast_config(),
    )
}

async fn poll_until<S, Q>(
    engine: &Engine<S, Q>,
    run_id: RunId,
    predicate: impl Fn(&WorkflowRun) -> bool,
) -> WorkflowRun
where
    S: RunStore,
    Q: QueueAdapter,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let run = engine.get_run(run_id, None).await.expect("run must exist");
        if predicate(&run) {
            return run;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for run {run_id}, last status {:?}", run.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// S1: a single-step workflow runs to completion and `checkProgress`
/// reports 100% only once `Completed`.
#[tokio::test]
async fn single_step_happy_path() {
    let engine = test_engine();

    let def = WorkflowDefinition::builder("greet")
        .step("say_hello", StepKind::Run)
        .handler(|ctx| {
            Box::pin(async move {
                let out = ctx
                    .step
                    .run("say_hello", || async move { Ok(json!({ "greeting": "hello" })) })
                    .await?;
                Ok(out)
            })
        });
    engine.register_workflow(def).unwrap();
    engine.start().await.unwrap();

    let run = engine
        .start_workflow("greet", json!({ "name": "ada" }), StartWorkflowOptions::default())
        .await
        .unwrap();

    let completed = poll_until(&engine, run.id, |r| r.status == RunStatus::Completed).await;
    assert_eq!(completed.output, Some(json!({ "greeting": "hello" })));
    assert!(completed.timeline.contains_key("say_hello"));

    let progress = engine.check_progress(run.id, None).await.unwrap();
    assert_eq!(progress.completion_percentage, 100);
    assert_eq!(progress.completed_steps, 1);
    assert_eq!(progress.total_steps, 1);

    engine.stop(Duration::from_secs(1)).await;
}

/// S2: a `waitFor` step parks the run at `Paused`, `checkProgress`
/// reports the halfway point, and `triggerEvent` resumes it to
/// completion with the event's payload folded into the step output.
#[tokio::test]
async fn wait_for_then_trigger_event_resumes() {
    let engine = test_engine();

    let def = WorkflowDefinition::builder("approval_flow")
        .step("prepare", StepKind::Run)
        .step("approval", StepKind::WaitFor)
        .handler(|ctx| {
            Box::pin(async move {
                let prepared = ctx
                    .step
                    .run("prepare", || async move { Ok(json!({ "ready": true })) })
                    .await?;
                let approval = ctx.step.wait_for("approval", "approval", None).await?;
                Ok(json!({ "prepared": prepared, "approval": approval }))
            })
        });
    engine.register_workflow(def).unwrap();
    engine.start().await.unwrap();

    let run = engine
        .start_workflow("approval_flow", json!({}), StartWorkflowOptions::default())
        .await
        .unwrap();

    let paused = poll_until(&engine, run.id, |r| r.status == RunStatus::Paused).await;
    assert!(paused.timeline.contains_key("prepare"));
    assert_eq!(paused.wait_for_marker("approval").unwrap().event_name, "approval");

    let progress = engine.check_progress(run.id, None).await.unwrap();
    assert_eq!(progress.completion_percentage, 50);

    engine
        .trigger_event(run.id, None, "approval", Some(json!({ "approved": true })))
        .await
        .unwrap();

    let completed = poll_until(&engine, run.id, |r| r.status == RunStatus::Completed).await;
    assert_eq!(
        completed.output,
        Some(json!({
            "prepared": { "ready": true },
            "approval": { "approved": true },
        }))
    );

    let progress = engine.check_progress(run.id, None).await.unwrap();
    assert_eq!(progress.completion_percentage, 100);

    engine.stop(Duration::from_secs(1)).await;
}

/// A `waitFor` mismatched against the wrong event name re-parks the run
/// on the same marker instead of advancing.
#[tokio::test]
async fn mismatched_event_does_not_resume() {
    let engine = test_engine();

    let def = WorkflowDefinition::builder("gate")
        .step("gate", StepKind::WaitFor)
        .handler(|ctx| {
            Box::pin(async move {
                let v = ctx.step.wait_for("gate", "open", None).await?;
                Ok(v)
            })
        });
    engine.register_workflow(def).unwrap();
    engine.start().await.unwrap();

    let run = engine
        .start_workflow("gate", json!({}), StartWorkflowOptions::default())
        .await
        .unwrap();

    poll_until(&engine, run.id, |r| r.status == RunStatus::Paused).await;

    engine.trigger_event(run.id, None, "not-open", None).await.unwrap();

    // Give the dispatcher a few ticks to settle the mismatched event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let run = engine.get_run(run.id, None).await.unwrap();
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.wait_for_marker("gate").unwrap().event_name, "open");

    engine.trigger_event(run.id, None, "open", Some(json!({ "ok": true }))).await.unwrap();
    let completed = poll_until(&engine, run.id, |r| r.status == RunStatus::Completed).await;
    assert_eq!(completed.output, Some(json!({ "ok": true })));

    engine.stop(Duration::from_secs(1)).await;
}

/// S5: `startWorkflow` calls sharing an idempotency key return the
/// same run while it's non-terminal, but mint a fresh run once the
/// prior one has reached a terminal state.
#[tokio::test]
async fn idempotency_key_dedupes_active_runs_only() {
    let engine = test_engine();

    let def = WorkflowDefinition::builder("idempotent_flow")
        .step("park", StepKind::WaitFor)
        .handler(|ctx| {
            Box::pin(async move {
                ctx.step.wait_for("park", "release", None).await?;
                Ok(json!({}))
            })
        });
    engine.register_workflow(def).unwrap();
    // Deliberately not started: this test only exercises the
    // idempotency-key check on `start_workflow`, not the dispatch loop.

    let options = StartWorkflowOptions {
        idempotency_key: Some("key-1".to_string()),
        ..Default::default()
    };

    let first = engine
        .start_workflow("idempotent_flow", json!({}), options.clone())
        .await
        .unwrap();
    let second = engine
        .start_workflow("idempotent_flow", json!({}), options.clone())
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    engine.cancel_workflow(first.id, None).await.unwrap();

    let third = engine
        .start_workflow("idempotent_flow", json!({}), options)
        .await
        .unwrap();
    assert_ne!(third.id, first.id);
}

/// `pauseWorkflow`/`resumeWorkflow` perform an administrative pause
/// that carries no event marker: resume just flips the run back to
/// `Running` without replaying any step.
#[tokio::test]
async fn administrative_pause_and_resume_round_trip() {
    let engine = test_engine();

    let def = WorkflowDefinition::builder("steady")
        .step("a", StepKind::Run)
        .step("b", StepKind::Run)
        .handler(|ctx| {
            Box::pin(async move {
                ctx.step.run("a", || async move { Ok(json!({})) }).await?;
                ctx.step.run("b", || async move { Ok(json!({})) }).await?;
                Ok(json!({ "done": true }))
            })
        });
    engine.register_workflow(def).unwrap();

    let run = engine
        .start_workflow("steady", json!({}), StartWorkflowOptions::default())
        .await
        .unwrap();

    let paused = engine.pause_workflow(run.id, None).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert!(paused.paused_at.is_some());

    let resumed = engine.resume_workflow(run.id, None).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Running);

    engine.start().await.unwrap();
    let completed = poll_until(&engine, run.id, |r| r.status == RunStatus::Completed).await;
    assert_eq!(completed.output, Some(json!({ "done": true })));

    engine.stop(Duration::from_secs(1)).await;
}

/// A non-retryable step failure fails the run immediately even though
/// retries remain in its budget.
#[tokio::test]
async fn non_retryable_failure_skips_retry_budget() {
    let engine = test_engine();

    let def = WorkflowDefinition::builder("doomed")
        .step("boom", StepKind::Run)
        .handler(|ctx| {
            Box::pin(async move {
                ctx.step
                    .run("boom", || async move { Err(WorkflowError::not_retryable("fatal")) })
                    .await?;
                Ok(json!({}))
            })
        });
    engine.register_workflow(def).unwrap();
    engine.start().await.unwrap();

    let run = engine
        .start_workflow(
            "doomed",
            json!({}),
            StartWorkflowOptions {
                max_retries: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let failed = poll_until(&engine, run.id, |r| r.status == RunStatus::Failed).await;
    assert_eq!(failed.retry_count, 0);
    assert_eq!(failed.error.as_deref(), Some("fatal"));

    engine.stop(Duration::from_secs(1)).await;
}

/// `cancelWorkflow` is cooperative: a run already parked on a
/// `waitFor` marker stays `Cancelled` even if the matching event later
/// arrives.
#[tokio::test]
async fn cancelled_run_ignores_late_events() {
    let engine = test_engine();

    let def = WorkflowDefinition::builder("cancellable")
        .step("wait", StepKind::WaitFor)
        .handler(|ctx| {
            Box::pin(async move {
                let v = ctx.step.wait_for("wait", "go", None).await?;
                Ok(v)
            })
        });
    engine.register_workflow(def).unwrap();
    engine.start().await.unwrap();

    let run = engine
        .start_workflow("cancellable", json!({}), StartWorkflowOptions::default())
        .await
        .unwrap();
    poll_until(&engine, run.id, |r| r.status == RunStatus::Paused).await;

    let cancelled = engine.cancel_workflow(run.id, None).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    engine.trigger_event(run.id, None, "go", Some(json!({ "n": 1 }))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let run = engine.get_run(run.id, None).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.output, None);

    engine.stop(Duration::from_secs(1)).await;
}

/// `getRuns` paginates and filters by workflow id.
#[tokio::test]
async fn get_runs_filters_by_workflow_id() {
    let engine = test_engine();

    for id in ["alpha", "beta"] {
        let def = WorkflowDefinition::builder(id)
            .step("a", StepKind::Run)
            .handler(|ctx| Box::pin(async move { Ok(ctx.input) }));
        engine.register_workflow(def).unwrap();
    }

    for _ in 0..3 {
        engine
            .start_workflow("alpha", json!({}), StartWorkflowOptions::default())
            .await
            .unwrap();
    }
    engine
        .start_workflow("beta", json!({}), StartWorkflowOptions::default())
        .await
        .unwrap();

    let page = engine
        .get_runs(ListRunsFilter {
            workflow_id: Some("alpha".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.items.len(), 3);
    assert!(page.items.iter().all(|r| r.workflow_id == "alpha"));
}

/// S3: a step that fails twice then succeeds retries with a growing
/// backoff and completes without exhausting its retry budget.
#[tokio::test]
async fn retryable_failure_eventually_succeeds() {
    let engine = test_engine();

    let attempts = Arc::new(AtomicUsize::new(0));
    let handler_attempts = attempts.clone();

    let def = WorkflowDefinition::builder("flaky")
        .step("maybe", StepKind::Run)
        .options(WorkflowOptions::new().with_retry(
            RetryPolicy::new()
                .with_min_delay(Duration::from_millis(15))
                .with_factor(2.0)
                .with_jitter(false),
        ))
        .handler(move |ctx| {
            let attempts = handler_attempts.clone();
            Box::pin(async move {
                let out = ctx
                    .step
                    .run("maybe", || {
                        let attempts = attempts.clone();
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                                Err(WorkflowError::new("not yet"))
                            } else {
                                Ok(json!({ "ok": true }))
                            }
                        }
                    })
                    .await?;
                Ok(out)
            })
        });
    engine.register_workflow(def).unwrap();
    engine.start().await.unwrap();

    let started = tokio::time::Instant::now();
    let run = engine
        .start_workflow(
            "flaky",
            json!({}),
            StartWorkflowOptions {
                max_retries: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let completed = poll_until(&engine, run.id, |r| r.status == RunStatus::Completed).await;
    assert_eq!(completed.output, Some(json!({ "ok": true })));
    assert_eq!(completed.retry_count, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // min_delay 15ms then 30ms before the step finally succeeds.
    assert!(started.elapsed() >= Duration::from_millis(40));

    engine.stop(Duration::from_secs(1)).await;
}

/// S4: retry exhaustion fails the run and fires `onFailure`/`onComplete`
/// exactly once each.
#[tokio::test]
async fn retry_exhaustion_fires_failure_and_complete_once() {
    let engine = test_engine();

    let failure_calls = Arc::new(AtomicUsize::new(0));
    let complete_calls = Arc::new(AtomicUsize::new(0));
    let (f1, c1) = (failure_calls.clone(), complete_calls.clone());

    let def = WorkflowDefinition::builder("always_fails")
        .step("boom", StepKind::Run)
        .options(WorkflowOptions::new().with_retry(
            RetryPolicy::new()
                .with_min_delay(Duration::from_millis(10))
                .with_jitter(false),
        ))
        .hooks(
            Hooks::new()
                .with_on_failure(move |_| {
                    f1.fetch_add(1, Ordering::SeqCst);
                })
                .with_on_complete(move |_| {
                    c1.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .handler(|ctx| {
            Box::pin(async move {
                ctx.step
                    .run("boom", || async move { Err(WorkflowError::new("still broken")) })
                    .await?;
                Ok(json!({}))
            })
        });
    engine.register_workflow(def).unwrap();
    engine.start().await.unwrap();

    let run = engine
        .start_workflow(
            "always_fails",
            json!({}),
            StartWorkflowOptions {
                max_retries: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let failed = poll_until(&engine, run.id, |r| r.status == RunStatus::Failed).await;
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error.as_deref(), Some("still broken"));

    // Give the dispatcher a few idle ticks in case a stray job would
    // re-settle the already-failed run and double-fire a hook.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(failure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(complete_calls.load(Ordering::SeqCst), 1);

    engine.stop(Duration::from_secs(1)).await;
}

/// S6: a concurrency-limited workflow never runs more than `limit`
/// dispatches at once, even with many runs started at once.
#[tokio::test]
async fn concurrency_limit_caps_simultaneous_dispatches() {
    let engine = test_engine();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let (in_flight_h, max_observed_h) = (in_flight.clone(), max_observed.clone());

    let def = WorkflowDefinition::builder("throttled")
        .step("work", StepKind::Run)
        .options(WorkflowOptions::new().with_concurrency(2))
        .handler(move |ctx| {
            let in_flight = in_flight_h.clone();
            let max_observed = max_observed_h.clone();
            Box::pin(async move {
                let out = ctx
                    .step
                    .run("work", || {
                        let in_flight = in_flight.clone();
                        let max_observed = max_observed.clone();
                        async move {
                            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_observed.fetch_max(current, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(80)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(json!({}))
                        }
                    })
                    .await?;
                Ok(out)
            })
        });
    engine.register_workflow(def).unwrap();
    engine.start().await.unwrap();

    let mut runs = Vec::new();
    for _ in 0..6 {
        let run = engine
            .start_workflow("throttled", json!({}), StartWorkflowOptions::default())
            .await
            .unwrap();
        runs.push(run.id);
    }

    for run_id in runs {
        poll_until(&engine, run_id, |r| r.status == RunStatus::Completed).await;
    }

    assert!(max_observed.load(Ordering::SeqCst) <= 2);
    assert!(max_observed.load(Ordering::SeqCst) >= 1);

    engine.stop(Duration::from_secs(1)).await;
}
