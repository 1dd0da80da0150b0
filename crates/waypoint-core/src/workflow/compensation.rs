//! Saga-style unwind of the compensation stack.

use tokio_util::sync::CancellationToken;
use waypoint_types::event::WorkflowEvent;

use super::checkpoint::CheckpointManager;
use super::context::StepContext;
use super::retry::retry_with_policy;
use super::step::StepError;
use super::step_runner::StepRunner;
use crate::repository::state::StateRepository;

/// Counts of an unwind pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct UnwindReport {
    pub(crate) executed: usize,
    pub(crate) failed: usize,
}

/// Pop and run every recorded compensation, newest first.
///
/// Each record is popped before its handler runs, so no compensation runs
/// twice even if the process dies mid-unwind. Failures are recorded in the
/// state's error history and never stop the unwind. The state is saved after
/// every compensation when `checkpoints` is set.
pub(crate) async fn unwind<R: StateRepository>(
    runner: &StepRunner,
    checkpoints: Option<&CheckpointManager<R>>,
) -> UnwindReport {
    // Compensations run even when the run itself was cancelled.
    let token = CancellationToken::new();
    let mut report = UnwindReport::default();

    while let Some(record) = runner.state.update(|s| s.compensations.pop()) {
        let name = record.step_name;
        let result = match runner.workflow.compensation_for(&name) {
            Some(compensation) => {
                let policy = compensation.retry.resolve(&runner.retry_defaults);
                retry_with_policy(
                    &policy,
                    &token,
                    |attempt| {
                        let ctx = StepContext::new(
                            &name,
                            attempt,
                            token.clone(),
                            runner.signals.clone(),
                            runner.state.clone(),
                        );
                        (compensation.handler)(ctx, runner.state.clone())
                    },
                    |attempt, error, will_retry| {
                        tracing::warn!(
                            state_id = %runner.state_id,
                            step = %name,
                            attempt,
                            will_retry,
                            error = %error,
                            "compensation attempt failed"
                        );
                    },
                )
                .await
            }
            None => Err(StepError::failed("no compensation registered")),
        };

        match &result {
            Ok(()) => {
                report.executed += 1;
                tracing::info!(state_id = %runner.state_id, step = %name, "compensation executed");
            }
            Err(error) => {
                report.failed += 1;
                runner
                    .state
                    .push_error(format!("compensation '{name}' failed: {error}"));
                tracing::warn!(
                    state_id = %runner.state_id,
                    step = %name,
                    error = %error,
                    "compensation failed, continuing unwind"
                );
            }
        }
        runner.events.publish(WorkflowEvent::CompensationExecuted {
            state_id: runner.state_id.clone(),
            step_name: name.clone(),
            success: result.is_ok(),
        });

        if let Some(checkpoints) = checkpoints {
            if let Err(e) = checkpoints.checkpoint_handle(&runner.state).await {
                tracing::warn!(state_id = %runner.state_id, error = %e, "checkpoint after compensation failed");
                runner.state.push_error(format!("checkpoint save failed: {e}"));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use waypoint_types::workflow::{CompensationRecord, WorkflowState, WorkflowStatus};

    use super::*;
    use crate::event::EventBus;
    use crate::repository::memory::MemoryStateRepository;
    use crate::repository::state::Unpersisted;
    use crate::workflow::builder::{ActionBuilder, WorkflowBuilder};
    use crate::workflow::context::StateHandle;
    use crate::workflow::retry::RetryPolicy;
    use crate::workflow::signal::SignalManager;

    fn runner_for(workflow: crate::workflow::definition::Workflow, records: &[&str]) -> StepRunner {
        let mut state = WorkflowState::new("order-1".to_string(), "order".to_string(), HashMap::new());
        state.status = WorkflowStatus::Compensating;
        state.compensations = records
            .iter()
            .enumerate()
            .map(|(i, name)| CompensationRecord {
                step_name: name.to_string(),
                step_index: i,
            })
            .collect();
        StepRunner {
            workflow: Arc::new(workflow),
            state: StateHandle::new(state),
            cancel: CancellationToken::new(),
            signals: SignalManager::new(),
            events: EventBus::new(16),
            retry_defaults: RetryPolicy::immediate(3),
            approval_timeout: None,
            late_branches: None,
            state_id: "order-1".to_string(),
        }
    }

    #[tokio::test]
    async fn unwind_runs_in_reverse_and_survives_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
        let workflow = WorkflowBuilder::new("order")
            .action("a", |_, _| async { Ok(()) })
            .compensate(move |_, _| {
                let log = l1.clone();
                async move {
                    log.lock().unwrap().push("undo-a");
                    Ok(())
                }
            })
            .action("b", |_, _| async { Ok(()) })
            .compensate(move |_, _| {
                let log = l2.clone();
                async move {
                    log.lock().unwrap().push("undo-b");
                    Err(StepError::failed("refund api down"))
                }
            })
            .action("c", |_, _| async { Ok(()) })
            .compensate(move |_, _| {
                let log = l3.clone();
                async move {
                    log.lock().unwrap().push("undo-c");
                    Ok(())
                }
            })
            .build()
            .unwrap();

        let runner = runner_for(workflow, &["a", "b", "c"]);
        let report = unwind::<Unpersisted>(&runner, None).await;

        assert_eq!(*log.lock().unwrap(), vec!["undo-c", "undo-b", "undo-a"]);
        assert_eq!(report, UnwindReport { executed: 2, failed: 1 });
        let state = runner.state.snapshot();
        assert!(state.compensations.is_empty());
        assert_eq!(
            state.errors,
            vec!["compensation 'b' failed: refund api down".to_string()]
        );
    }

    #[tokio::test]
    async fn unwind_retries_compensation_and_persists() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let workflow = WorkflowBuilder::new("order")
            .action_with(
                ActionBuilder::new("charge", |_, _| async { Ok(()) })
                    .compensate(move |_, _| {
                        let counter = counter.clone();
                        async move {
                            let mut n = counter.lock().unwrap();
                            *n += 1;
                            if *n < 2 {
                                Err(StepError::failed("transient"))
                            } else {
                                Ok(())
                            }
                        }
                    })
                    .compensation_retry(RetryPolicy::immediate(3)),
            )
            .build()
            .unwrap();

        let runner = runner_for(workflow, &["charge"]);
        let checkpoints = CheckpointManager::new(MemoryStateRepository::new());
        let report = unwind(&runner, Some(&checkpoints)).await;

        assert_eq!(report, UnwindReport { executed: 1, failed: 0 });
        assert_eq!(*attempts.lock().unwrap(), 2);
        let saved = checkpoints.repo().get("order-1").unwrap();
        assert!(saved.compensations.is_empty());
        assert!(saved.errors.is_empty());
    }
}
