use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use waypoint_core::workflow::{Engine, StateHandle, StepContext, StepError, Workflow, WorkflowBuilder};
use waypoint_infra::sqlite::{DatabasePool, SqliteStateRepository};
use waypoint_types::config::EngineConfig;
use waypoint_types::workflow::WorkflowStatus;

fn approval_flow() -> Workflow {
    WorkflowBuilder::new("expense")
        .action("submit", |ctx: StepContext, _: StateHandle| async move {
            ctx.set_result(json!({ "amount": 120 }));
            Ok::<(), StepError>(())
        })
        .approval("review", ["lead"], None)
        .action("payout", |_: StepContext, _: StateHandle| async { Ok(()) })
        .build()
        .unwrap()
}

async fn open(url: &str) -> Engine<SqliteStateRepository> {
    let pool = DatabasePool::new(url).await.unwrap();
    let engine = Engine::with_persistence(EngineConfig::default(), SqliteStateRepository::new(pool));
    engine.register(approval_flow());
    engine
}

async fn wait_for_status(engine: &Engine<SqliteStateRepository>, id: &str, status: WorkflowStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let state = engine.load_state(id).await.unwrap();
            if state.is_some_and(|s| s.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("status not reached in time");
}

#[tokio::test]
async fn paused_run_is_approved_after_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("waypoint.db").display());

    let id = {
        let engine = open(&url).await;
        let id = engine
            .start(CancellationToken::new(), "expense", HashMap::new())
            .await
            .unwrap();
        wait_for_status(&engine, &id, WorkflowStatus::Paused).await;
        id
    };

    let engine = open(&url).await;
    let paused = engine.load_state(&id).await.unwrap().unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.pending_approval.as_ref().unwrap().step_name, "review");

    engine.approve(&id, "lead").await.unwrap();
    wait_for_status(&engine, &id, WorkflowStatus::Completed).await;

    let done = engine.load_state(&id).await.unwrap().unwrap();
    assert_eq!(done.step_results["submit"], json!({ "amount": 120 }));
    assert_eq!(done.step_results["review"], json!({ "approved_by": ["lead"] }));
    assert!(done.step_results.contains_key("payout"));
    assert!(done.pending_approval.is_none());
}
