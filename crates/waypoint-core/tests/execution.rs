mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{Log, fail, persistent_engine, record};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use waypoint_core::workflow::{
    ActionBuilder, Branch, DefinitionError, Engine, EngineError, JoinPolicy, RetryPolicy,
    StateHandle, StepContext, StepError, WorkflowBuilder,
};
use waypoint_types::config::EngineConfig;
use waypoint_types::workflow::WorkflowStatus;

#[tokio::test]
async fn sequential_run_completes_on_last_step() {
    let log = Log::default();
    let wf = WorkflowBuilder::new("pipeline")
        .action("one", record(&log, "one"))
        .action("two", record(&log, "two"))
        .action("three", record(&log, "three"))
        .action("four", record(&log, "four"))
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.current_step, 3);
    assert_eq!(log.entries(), vec!["one", "two", "three", "four"]);
    assert_eq!(state.step_results.len(), 4);
    assert_eq!(state.checkpoints.get("three"), Some(&2));
    assert!(state.errors.is_empty());
    assert!(state.completed_at.is_some());
}

#[tokio::test]
async fn unwind_runs_registered_compensations_newest_first() {
    let log = Log::default();
    let wf = WorkflowBuilder::new("saga")
        .action("a", record(&log, "a"))
        .compensate(record(&log, "undo-a"))
        .action("b", record(&log, "b"))
        .compensate(record(&log, "undo-b"))
        .action("c", fail(&log, "c", "boom"))
        .compensate(record(&log, "undo-c"))
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(log.entries(), vec!["a", "b", "c", "undo-b", "undo-a"]);
    assert!(state.compensations.is_empty());
    assert_eq!(state.errors, vec!["c: boom".to_string()]);
}

#[tokio::test]
async fn failed_shipment_refunds_the_charge() {
    let log = Log::default();
    let wf = WorkflowBuilder::new("order")
        .action("validate", record(&log, "validate"))
        .action("charge", record(&log, "charge"))
        .compensate(record(&log, "refund"))
        .action("ship", fail(&log, "ship", "carrier unavailable"))
        .build()
        .unwrap();

    let (engine, repo) = persistent_engine(EngineConfig::default());
    let state = engine
        .execute(
            CancellationToken::new(),
            wf,
            HashMap::from([("order_id".to_string(), json!("o-17"))]),
        )
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(log.entries(), vec!["validate", "charge", "ship", "refund"]);
    assert!(state.errors.iter().any(|e| e.contains("carrier unavailable")));

    let stored = repo.get(&state.id).unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
    assert!(stored.compensations.is_empty());
}

#[tokio::test]
async fn compensation_failure_does_not_stop_unwind() {
    let log = Log::default();
    let wf = WorkflowBuilder::new("saga")
        .action("a", record(&log, "a"))
        .compensate(record(&log, "undo-a"))
        .action("b", record(&log, "b"))
        .compensate(fail(&log, "undo-b", "ledger offline"))
        .action("c", fail(&log, "c", "boom"))
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(log.entries(), vec!["a", "b", "c", "undo-b", "undo-a"]);
    assert!(
        state
            .errors
            .contains(&"compensation 'b' failed: ledger offline".to_string())
    );
}

#[tokio::test]
async fn start_unknown_workflow_creates_nothing() {
    let (engine, repo) = persistent_engine(EngineConfig::default());

    let err = engine
        .start(CancellationToken::new(), "missing", HashMap::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Definition(DefinitionError::UnknownWorkflow(ref name)) if name == "missing"
    ));
    assert!(repo.is_empty());
    assert!(engine.running().is_empty());
}

#[tokio::test]
async fn error_hook_absorbs_failures() {
    let log = Log::default();
    let wf = WorkflowBuilder::new("best-effort")
        .action("required", record(&log, "required"))
        .action("optional", fail(&log, "optional", "not reachable"))
        .action("final", record(&log, "final"))
        .on_error(|step, err| {
            if step == "optional" {
                Ok(())
            } else {
                Err(err.clone())
            }
        })
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(log.entries(), vec!["required", "optional", "final"]);
    assert_eq!(state.errors, vec!["optional: not reachable".to_string()]);
}

#[tokio::test]
async fn completion_hook_sees_final_state() {
    let seen = Arc::new(std::sync::Mutex::new(None));
    let sink = Arc::clone(&seen);
    let log = Log::default();
    let wf = WorkflowBuilder::new("hooked")
        .action("only", fail(&log, "only", "nope"))
        .on_complete(move |state| {
            *sink.lock().unwrap() = Some(state.status);
        })
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), Some(WorkflowStatus::Failed));
}

#[tokio::test]
async fn retries_until_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let wf = WorkflowBuilder::new("flaky")
        .action_with(
            ActionBuilder::new("call", move |ctx: StepContext, _: StateHandle| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() < 3 {
                        Err(StepError::failed("transient"))
                    } else {
                        ctx.set_result(json!({ "attempt": ctx.attempt() }));
                        Ok(())
                    }
                }
            })
            .retry(RetryPolicy::immediate(3)),
        )
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(state.step_results["call"], json!({ "attempt": 3 }));
    assert!(state.errors.is_empty());
}

#[tokio::test]
async fn timeout_fails_the_step() {
    let wf = WorkflowBuilder::new("slow")
        .action_with(
            ActionBuilder::new("wait", |_: StepContext, _: StateHandle| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .timeout(Duration::from_millis(20)),
        )
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.errors.len(), 1);
    assert!(state.errors[0].starts_with("wait: timed out"));
}

#[tokio::test]
async fn conditional_commits_to_one_branch() {
    let log = Log::default();
    let wf = WorkflowBuilder::new("routing")
        .conditional(
            "size",
            |s| s.get("amount").and_then(|v| v.as_i64()).unwrap_or(0) > 100,
            |b| b.action("manual-review", record(&log, "manual")),
            |b| b.action("auto-approve", record(&log, "auto")),
        )
        .build()
        .unwrap();
    let wf = Arc::new(wf);

    let engine = Engine::new(EngineConfig::default());
    let big = engine
        .execute(
            CancellationToken::new(),
            Arc::clone(&wf),
            HashMap::from([("amount".to_string(), json!(500))]),
        )
        .await
        .unwrap();
    let small = engine
        .execute(
            CancellationToken::new(),
            wf,
            HashMap::from([("amount".to_string(), json!(5))]),
        )
        .await
        .unwrap();

    assert_eq!(big.step_results["size"], json!({ "branch": "then" }));
    assert!(big.step_results.contains_key("manual-review"));
    assert_eq!(small.step_results["size"], json!({ "branch": "else" }));
    assert!(small.step_results.contains_key("auto-approve"));
    assert_eq!(log.entries(), vec!["manual", "auto"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_all_failure_keeps_completed_branch_results() {
    let log = Log::default();
    let slow = |_: StepContext, _: StateHandle| async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(())
    };
    let late_fail = |_: StepContext, _: StateHandle| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Err(StepError::failed("inventory mismatch"))
    };
    let wf = WorkflowBuilder::new("fanout")
        .parallel(
            "prepare",
            JoinPolicy::WaitAll,
            [
                Branch::new().action("left", record(&log, "left")),
                Branch::new().action("middle", late_fail),
                Branch::new()
                    .action("right-slow", slow)
                    .action("right-after", record(&log, "right-after")),
            ],
        )
        .action("never", record(&log, "never"))
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert!(state.step_results.contains_key("left"));
    assert!(state.step_results.contains_key("right-slow"));
    assert!(!state.step_results.contains_key("right-after"));
    assert!(!state.step_results.contains_key("prepare"));
    assert_eq!(state.errors, vec!["middle: inventory mismatch".to_string()]);
    assert_eq!(log.entries(), vec!["left"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_any_returns_with_first_success() {
    let log = Log::default();
    let slow = {
        let log = log.clone();
        move |ctx: StepContext, _: StateHandle| {
            let log = log.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                log.push("slow");
                ctx.set_result(json!({ "price": 90 }));
                Ok(())
            }
        }
    };
    let wf = WorkflowBuilder::new("race")
        .parallel(
            "quote",
            JoinPolicy::WaitAny,
            [
                Branch::new().action("fast-quote", record(&log, "fast")),
                Branch::new().action("slow-quote", slow),
            ],
        )
        .action("book", record(&log, "book"))
        .build()
        .unwrap();

    let (engine, repo) = persistent_engine(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.step_results["quote"]["succeeded"], json!([0]));
    assert_eq!(log.entries(), vec!["fast", "book"]);
    assert!(!state.step_results.contains_key("slow-quote"));

    // The detached branch still lands its result in the saved state.
    common::eventually(|| {
        repo.get(&state.id)
            .is_some_and(|saved| saved.step_results.get("slow-quote") == Some(&json!({ "price": 90 })))
    })
    .await;
    assert_eq!(log.count("slow"), 1);
    let saved = repo.get(&state.id).unwrap();
    assert_eq!(saved.status, WorkflowStatus::Completed);
    assert!(saved.step_results.contains_key("book"));
}

#[tokio::test]
async fn wait_n_completes_once_enough_branches_succeed() {
    let log = Log::default();
    let slow = {
        let log = log.clone();
        move |_: StepContext, _: StateHandle| {
            let log = log.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                log.push("c");
                Ok(())
            }
        }
    };
    let wf = WorkflowBuilder::new("replicate")
        .parallel(
            "write",
            JoinPolicy::WaitN(2),
            [
                Branch::new().action("replica-a", record(&log, "a")),
                Branch::new().action("replica-b", record(&log, "b")),
                Branch::new().action("replica-c", slow),
            ],
        )
        .action("ack", record(&log, "ack"))
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.step_results["write"]["join"], json!("wait_n"));
    assert_eq!(state.step_results["write"]["required"], json!(2));
    assert_eq!(state.step_results["write"]["succeeded"], json!([0, 1]));
    assert_eq!(state.step_results["write"]["failed"], json!(0));
    assert_eq!(log.count("ack"), 1);
    assert_eq!(log.count("c"), 0);

    common::eventually(|| log.count("c") == 1).await;
}

#[tokio::test]
async fn wait_n_fails_once_quorum_is_unreachable() {
    let log = Log::default();
    let wf = WorkflowBuilder::new("replicate")
        .parallel(
            "write",
            JoinPolicy::WaitN(2),
            [
                Branch::new().action("replica-a", record(&log, "a")),
                Branch::new().action("replica-b", fail(&log, "b", "disk full")),
                Branch::new().action("replica-c", fail(&log, "c", "disk full")),
            ],
        )
        .action("ack", record(&log, "ack"))
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine
        .execute(CancellationToken::new(), wf, HashMap::new())
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert!(!state.step_results.contains_key("write"));
    assert_eq!(log.count("ack"), 0);
    assert!(state.errors.iter().any(|e| e.contains("disk full")));
}

#[tokio::test]
async fn cancelled_run_fails_without_compensation() {
    let log = Log::default();
    let token = CancellationToken::new();
    let trigger = token.clone();
    let wf = WorkflowBuilder::new("cancellable")
        .action("reserve", record(&log, "reserve"))
        .compensate(record(&log, "release"))
        .action("cancel-here", move |_: StepContext, _: StateHandle| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Ok(())
            }
        })
        .action("never", record(&log, "never"))
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine.execute(token, wf, HashMap::new()).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(log.entries(), vec!["reserve"]);
    assert_eq!(state.errors, vec!["never: cancelled".to_string()]);
    assert_eq!(state.compensations.len(), 1);
    // Cancellation is seen before the next step is entered.
    assert_eq!(state.current_step, 1);
    assert_eq!(state.checkpoints.get("cancel-here"), Some(&1));
    assert!(!state.checkpoints.contains_key("never"));
}

#[tokio::test]
async fn escalated_cancellation_unwinds() {
    let log = Log::default();
    let token = CancellationToken::new();
    let trigger = token.clone();
    let wf = WorkflowBuilder::new("cancellable")
        .action("reserve", record(&log, "reserve"))
        .compensate(record(&log, "release"))
        .action("cancel-here", move |_: StepContext, _: StateHandle| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Ok(())
            }
        })
        .action("never", record(&log, "never"))
        .on_error(|_, err| Err(err.clone()))
        .build()
        .unwrap();

    let engine = Engine::new(EngineConfig::default());
    let state = engine.execute(token, wf, HashMap::new()).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(log.entries(), vec!["reserve", "release"]);
    assert!(state.compensations.is_empty());
}
