//! Step dispatch for every step kind.
//!
//! `StepRunner` executes one step against a live instance: actions with
//! retries and timeouts, conditionals, parallel fan-out/join and approval
//! gates. Failures of a step are offered to the workflow's error hook at the
//! point where they happen; escalations travel up as `Halt` without being
//! offered again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{ApprovalOutcome, CompensationRecord, PendingApproval};

use super::context::{StateHandle, StepContext};
use super::definition::Workflow;
use super::retry::{RetryPolicy, retry_with_policy};
use super::signal::SignalManager;
use super::step::{
    ActionStep, ApprovalStep, Chain, ConditionalStep, JoinPolicy, ParallelStep, Step, StepError,
};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a run stopped before reaching the end of its steps.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Halt {
    /// An escalated step failure.
    Failed { step: String, error: StepError },
    /// The run's cancellation token fired.
    Cancelled,
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::Failed { step, error } => write!(f, "step '{step}' failed: {error}"),
            Halt::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Completed,
    /// Paused at an approval gate; the executing task must exit.
    Suspended,
}

#[derive(Debug)]
pub(crate) enum StepFault {
    /// The step itself failed; the error hook has not seen it yet.
    Step(StepError),
    /// A nested failure that was already escalated, or cancellation.
    Halt(Halt),
}

type BranchResult = (usize, Result<(), Halt>);

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Called with the instance state once detached branches have all returned.
pub(crate) type LateBranchHook = Arc<dyn Fn(StateHandle) -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything a step needs from the engine, bundled per run.
#[derive(Clone)]
pub(crate) struct StepRunner {
    pub(crate) workflow: Arc<Workflow>,
    pub(crate) state: StateHandle,
    pub(crate) cancel: CancellationToken,
    pub(crate) signals: SignalManager,
    pub(crate) events: EventBus,
    pub(crate) retry_defaults: RetryPolicy,
    pub(crate) approval_timeout: Option<Duration>,
    pub(crate) late_branches: Option<LateBranchHook>,
    pub(crate) state_id: String,
}

impl StepRunner {
    /// Run one step of any kind.
    pub(crate) async fn execute_step(
        &self,
        step: &Step,
        top_index: usize,
    ) -> Result<StepOutcome, StepFault> {
        tracing::debug!(
            state_id = %self.state_id,
            step = step.name(),
            kind = step.kind(),
            "step started"
        );
        self.events.publish(WorkflowEvent::StepStarted {
            state_id: self.state_id.clone(),
            step_name: step.name().to_string(),
            step_kind: step.kind().to_string(),
        });

        let started = Instant::now();
        let outcome = match step {
            Step::Action(action) => self.run_action(action, top_index).await?,
            Step::Conditional(conditional) => self.run_conditional(conditional, top_index).await?,
            Step::Parallel(parallel) => self.run_parallel(parallel, top_index).await?,
            Step::ApprovalGate(gate) => self.run_approval(gate, top_index)?,
        };

        if outcome == StepOutcome::Completed {
            let duration_ms = started.elapsed().as_millis() as u64;
            tracing::debug!(
                state_id = %self.state_id,
                step = step.name(),
                duration_ms,
                "step completed"
            );
            self.events.publish(WorkflowEvent::StepCompleted {
                state_id: self.state_id.clone(),
                step_name: step.name().to_string(),
                duration_ms,
            });
        }
        Ok(outcome)
    }

    /// Run a nested chain to completion.
    ///
    /// Boxed because chains nest inside conditionals and parallels.
    pub(crate) fn run_chain(&self, steps: Chain, top_index: usize) -> BoxFuture<'static, Result<(), Halt>> {
        let runner = self.clone();
        Box::pin(async move {
            for step in steps.iter() {
                if runner.cancel.is_cancelled() {
                    return Err(Halt::Cancelled);
                }
                match runner.execute_step(step, top_index).await {
                    Ok(StepOutcome::Completed) => {}
                    // Gates are rejected at build time below the top level.
                    Ok(StepOutcome::Suspended) => {
                        return Err(Halt::Failed {
                            step: step.name().to_string(),
                            error: StepError::failed("approval gate inside a branch"),
                        });
                    }
                    Err(StepFault::Step(error)) => runner.absorb_or_escalate(step.name(), error)?,
                    Err(StepFault::Halt(halt)) => return Err(halt),
                }
            }
            Ok(())
        })
    }

    /// Record a step failure and let the error hook decide.
    ///
    /// `Ok(())` means the failure was absorbed and execution continues with
    /// the next step.
    pub(crate) fn absorb_or_escalate(&self, step: &str, error: StepError) -> Result<(), Halt> {
        self.state.push_error(format!("{step}: {error}"));

        let Some(hook) = self.workflow.error_hook() else {
            return Err(Halt::Failed {
                step: step.to_string(),
                error,
            });
        };

        match hook(step, &error) {
            Ok(()) => {
                tracing::warn!(
                    state_id = %self.state_id,
                    step,
                    error = %error,
                    "step failure absorbed by error hook"
                );
                Ok(())
            }
            Err(escalated) => {
                if escalated != error {
                    self.state.push_error(format!("{step}: {escalated}"));
                }
                Err(Halt::Failed {
                    step: step.to_string(),
                    error: escalated,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Action
    // -----------------------------------------------------------------------

    async fn run_action(&self, action: &ActionStep, top_index: usize) -> Result<StepOutcome, StepFault> {
        let policy = action.retry.resolve(&self.retry_defaults);
        let result = retry_with_policy(
            &policy,
            &self.cancel,
            |attempt| self.attempt_action(action, attempt),
            |attempt, error, will_retry| {
                tracing::warn!(
                    state_id = %self.state_id,
                    step = %action.name,
                    attempt,
                    will_retry,
                    error = %error,
                    "action attempt failed"
                );
                self.events.publish(WorkflowEvent::StepFailed {
                    state_id: self.state_id.clone(),
                    step_name: action.name.clone(),
                    error: error.to_string(),
                    will_retry,
                });
            },
        )
        .await;

        match result {
            Ok(()) => {
                self.state.update(|s| {
                    s.step_results
                        .entry(action.name.clone())
                        .or_insert(Value::Null);
                    if action.compensation.is_some() {
                        s.compensations.push(CompensationRecord {
                            step_name: action.name.clone(),
                            step_index: top_index,
                        });
                    }
                });
                Ok(StepOutcome::Completed)
            }
            Err(StepError::Cancelled) if self.cancel.is_cancelled() => {
                Err(StepFault::Halt(Halt::Cancelled))
            }
            Err(error) => Err(StepFault::Step(error)),
        }
    }

    fn attempt_action(
        &self,
        action: &ActionStep,
        attempt: u32,
    ) -> impl Future<Output = Result<(), StepError>> + Send + 'static {
        let ctx = StepContext::new(
            &action.name,
            attempt,
            self.cancel.clone(),
            self.signals.clone(),
            self.state.clone(),
        );
        let fut = (action.handler)(ctx, self.state.clone());
        let timeout = action.timeout;
        async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .unwrap_or(Err(StepError::Timeout(limit))),
                None => fut.await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conditional
    // -----------------------------------------------------------------------

    async fn run_conditional(
        &self,
        step: &ConditionalStep,
        top_index: usize,
    ) -> Result<StepOutcome, StepFault> {
        let snapshot = self.state.snapshot();
        let (label, branch) = if (step.predicate)(&snapshot) {
            ("then", &step.then_branch)
        } else {
            ("else", &step.else_branch)
        };
        tracing::debug!(
            state_id = %self.state_id,
            step = %step.name,
            branch = label,
            "conditional branch selected"
        );

        self.run_chain(branch.clone(), top_index)
            .await
            .map_err(StepFault::Halt)?;
        self.state
            .set_step_result(step.name.clone(), json!({ "branch": label }));
        Ok(StepOutcome::Completed)
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    async fn run_parallel(&self, step: &ParallelStep, top_index: usize) -> Result<StepOutcome, StepFault> {
        let total = step.branches.len();
        let required = step.join.required(total);
        let token = self.cancel.child_token();
        let branch_runner = StepRunner {
            cancel: token.clone(),
            ..self.clone()
        };

        let mut set: JoinSet<BranchResult> = JoinSet::new();
        for (idx, chain) in step.branches.iter().enumerate() {
            let fut = branch_runner.run_chain(chain.clone(), top_index);
            set.spawn(async move { (idx, fut.await) });
        }

        let mut succeeded: Vec<usize> = Vec::new();
        let mut failed = 0usize;
        let mut first_error: Option<Halt> = None;

        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok((idx, Ok(()))) => {
                    succeeded.push(idx);
                    Ok(())
                }
                Ok((_, Err(halt))) => Err(halt),
                Err(join_err) => Err(Halt::Failed {
                    step: step.name.clone(),
                    error: StepError::failed(format!("branch task failed: {join_err}")),
                }),
            };

            if let Err(halt) = result {
                failed += 1;
                let sibling_cancel = halt == Halt::Cancelled && !self.cancel.is_cancelled();
                if first_error.is_none() && !sibling_cancel {
                    first_error = Some(halt);
                }
                if step.join == JoinPolicy::WaitAll || total - failed < required {
                    token.cancel();
                }
            }

            if step.join != JoinPolicy::WaitAll
                && (succeeded.len() >= required || total - failed < required)
            {
                self.detach_branches(set, &step.name);
                break;
            }
        }

        succeeded.sort_unstable();
        if succeeded.len() >= required {
            self.state.set_step_result(
                step.name.clone(),
                json!({
                    "join": step.join.as_str(),
                    "required": required,
                    "succeeded": succeeded,
                    "failed": failed,
                }),
            );
            return Ok(StepOutcome::Completed);
        }

        if self.cancel.is_cancelled() {
            return Err(StepFault::Halt(Halt::Cancelled));
        }
        let error = match first_error {
            Some(Halt::Failed { step: inner, error }) => {
                tracing::warn!(
                    state_id = %self.state_id,
                    step = %step.name,
                    branch_step = %inner,
                    succeeded = succeeded.len(),
                    required,
                    "parallel step failed"
                );
                error
            }
            _ => StepError::failed(format!(
                "only {} of {required} required branches succeeded",
                succeeded.len()
            )),
        };
        Err(StepFault::Halt(Halt::Failed {
            step: step.name.clone(),
            error,
        }))
    }

    /// Let branches that are still running finish in the background.
    ///
    /// Dropping a `JoinSet` aborts its tasks, so it is handed to a drain task
    /// instead. Late branches keep writing results and errors into the shared
    /// state, which is saved once the last of them returns.
    fn detach_branches(&self, mut set: JoinSet<BranchResult>, step_name: &str) {
        if set.is_empty() {
            return;
        }
        let state_id = self.state_id.clone();
        let step_name = step_name.to_string();
        let hook = self.late_branches.clone();
        let state = self.state.clone();
        tracing::debug!(
            state_id = %state_id,
            step = %step_name,
            remaining = set.len(),
            "detaching unfinished branches"
        );
        tokio::spawn(async move {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((idx, Ok(()))) => {
                        tracing::debug!(state_id = %state_id, step = %step_name, branch = idx, "late branch completed");
                    }
                    Ok((idx, Err(halt))) => {
                        tracing::debug!(state_id = %state_id, step = %step_name, branch = idx, outcome = %halt, "late branch stopped");
                    }
                    Err(e) => {
                        tracing::warn!(state_id = %state_id, step = %step_name, error = %e, "late branch task failed");
                    }
                }
            }
            if let Some(hook) = hook {
                tracing::debug!(state_id = %state_id, step = %step_name, "saving late branch results");
                hook(state).await;
            }
        });
    }

    // -----------------------------------------------------------------------
    // Approval gate
    // -----------------------------------------------------------------------

    /// Record the request at the gate, or consume a resolved outcome when
    /// resumed. The engine flips the status to `Paused` when it parks the
    /// instance.
    fn run_approval(&self, gate: &ApprovalStep, top_index: usize) -> Result<StepOutcome, StepFault> {
        let now = Utc::now();
        let timeout = gate.timeout.or(self.approval_timeout);

        let resolved = self.state.update(|s| {
            let existing = s
                .pending_approval
                .as_ref()
                .filter(|p| p.step_name == gate.name)
                .map(|p| p.outcome.clone());
            match existing {
                Some(Some(outcome)) => {
                    s.pending_approval = None;
                    Some(outcome)
                }
                Some(None) => None,
                None => {
                    s.pending_approval = Some(PendingApproval {
                        step_name: gate.name.clone(),
                        step_index: top_index,
                        approvers: gate.approvers.clone(),
                        votes: Default::default(),
                        requested_at: now,
                        expires_at: expiry(now, timeout),
                        outcome: None,
                    });
                    None
                }
            }
        });

        match resolved {
            None => {
                tracing::info!(
                    state_id = %self.state_id,
                    step = %gate.name,
                    approvers = gate.approvers.len(),
                    "paused at approval gate"
                );
                Ok(StepOutcome::Suspended)
            }
            Some(ApprovalOutcome::Approved { approvers }) => {
                self.state
                    .set_step_result(gate.name.clone(), json!({ "approved_by": approvers }));
                Ok(StepOutcome::Completed)
            }
            Some(ApprovalOutcome::Rejected { approver, reason }) => {
                Err(StepFault::Step(StepError::Rejected { approver, reason }))
            }
        }
    }
}

/// Deadline of a gate requested at `now`. A timeout too large to represent
/// means the request never expires.
fn expiry(now: DateTime<Utc>, timeout: Option<Duration>) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(timeout?).ok()?;
    now.checked_add_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_adds_the_timeout() {
        let now = Utc::now();
        let deadline = expiry(now, Some(Duration::from_secs(3600))).unwrap();
        assert_eq!(deadline - now, chrono::Duration::hours(1));
        assert_eq!(expiry(now, None), None);
    }

    #[test]
    fn test_expiry_out_of_range_never_expires() {
        let now = Utc::now();
        let ages = Duration::from_secs(1_000_000 * 365 * 86_400);
        assert_eq!(expiry(now, Some(ages)), None);
        assert_eq!(expiry(now, Some(Duration::MAX)), None);
    }
}
