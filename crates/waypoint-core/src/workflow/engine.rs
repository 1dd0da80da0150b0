//! The workflow engine: registry, running-instance index and execution driver.
//!
//! Each instance runs on its own tokio task. Before every top-level step the
//! driver records the step position and saves a snapshot; at the end it
//! finalizes the status, unwinds compensations on failure, saves the terminal
//! state and calls the completion hook. An instance paused at an approval gate
//! has no task; resolving the approval relaunches it at the gate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_types::config::EngineConfig;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{ApprovalOutcome, WorkflowState, WorkflowStatus};

use super::approval::{ApprovalError, ApprovalManager, ApprovalProgress};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::compensation;
use super::context::StateHandle;
use super::definition::{DefinitionError, Workflow};
use super::retry::RetryPolicy;
use super::signal::SignalManager;
use super::step::{Step, StepError};
use super::step_runner::{Halt, LateBranchHook, StepFault, StepOutcome, StepRunner};
use crate::event::EventBus;
use crate::repository::state::{StateRepository, Unpersisted};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned synchronously by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Persistence(#[from] CheckpointError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("state '{id}' cannot be resumed from status {status}")]
    NotResumable { id: String, status: WorkflowStatus },

    #[error("state '{0}' is already executing")]
    AlreadyRunning(String),
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct RunningInstance {
    workflow: Arc<Workflow>,
    state: StateHandle,
    cancel: CancellationToken,
    /// A task is currently executing the instance.
    active: bool,
}

#[derive(Default)]
struct EngineIndex {
    workflows: HashMap<String, Arc<Workflow>>,
    running: HashMap<String, RunningInstance>,
}

struct EngineInner<R: StateRepository> {
    index: RwLock<EngineIndex>,
    checkpoints: Option<CheckpointManager<R>>,
    signals: SignalManager,
    approvals: ApprovalManager,
    events: EventBus,
    retry_defaults: RetryPolicy,
    config: EngineConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Durable workflow engine.
///
/// Cheap to clone; clones share the registry, running index, managers and
/// persistence backend.
pub struct Engine<R: StateRepository = Unpersisted> {
    inner: Arc<EngineInner<R>>,
}

impl<R: StateRepository> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine<Unpersisted> {
    /// Engine without persistence. `resume` and friends fail with
    /// `CheckpointError::NotConfigured`.
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }
}

impl<R: StateRepository + 'static> Engine<R> {
    /// Engine that saves every instance through `repo`.
    pub fn with_persistence(config: EngineConfig, repo: R) -> Self {
        Self::build(config, Some(CheckpointManager::new(repo)))
    }

    fn build(config: EngineConfig, checkpoints: Option<CheckpointManager<R>>) -> Self {
        let inner = EngineInner {
            index: RwLock::new(EngineIndex::default()),
            checkpoints,
            signals: SignalManager::with_buffer(config.signal_buffer),
            approvals: ApprovalManager::new(),
            events: EventBus::new(config.event_capacity),
            retry_defaults: RetryPolicy::from(&config.retry),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The persistence backend, if any.
    pub fn repository(&self) -> Option<&R> {
        self.inner.checkpoints.as_ref().map(CheckpointManager::repo)
    }

    pub fn signals(&self) -> &SignalManager {
        &self.inner.signals
    }

    pub fn approvals(&self) -> &ApprovalManager {
        &self.inner.approvals
    }

    /// Lifecycle events of every instance run by this engine.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Register a workflow under its name. The last registration wins.
    pub fn register(&self, workflow: impl Into<Arc<Workflow>>) {
        let workflow = workflow.into();
        tracing::debug!(workflow = workflow.name(), steps = workflow.step_count(), "workflow registered");
        self.write_index()
            .workflows
            .insert(workflow.name().to_string(), workflow);
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<Workflow>> {
        self.read_index().workflows.get(name).cloned()
    }

    /// Names of registered workflows, sorted.
    pub fn workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_index().workflows.keys().cloned().collect();
        names.sort();
        names
    }

    // -----------------------------------------------------------------------
    // Starting runs
    // -----------------------------------------------------------------------

    /// Start a registered workflow in the background and return its state id.
    ///
    /// The initial state is saved before the run is launched; if that save
    /// fails nothing is launched.
    pub async fn start(
        &self,
        cancel: CancellationToken,
        name: &str,
        input: HashMap<String, Value>,
    ) -> Result<String, EngineError> {
        let workflow = self
            .workflow(name)
            .ok_or_else(|| DefinitionError::UnknownWorkflow(name.to_string()))?;

        let state = new_state(&workflow, input);
        let id = state.id.clone();
        if let Some(checkpoints) = &self.inner.checkpoints {
            checkpoints.checkpoint(&state).await?;
        }

        let handle = StateHandle::new(state);
        self.claim(&id, workflow.clone(), handle.clone(), cancel.clone())?;
        self.spawn_run(workflow, handle, cancel);
        tracing::info!(state_id = %id, workflow = name, "workflow started");
        Ok(id)
    }

    /// Run `workflow` inline and return its final state.
    ///
    /// If the run pauses at an approval gate this keeps waiting until the
    /// instance reaches a terminal status or `cancel` fires, in which case
    /// the paused state is returned.
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        workflow: impl Into<Arc<Workflow>>,
        input: HashMap<String, Value>,
    ) -> Result<WorkflowState, EngineError> {
        let workflow = workflow.into();
        let state = new_state(&workflow, input);
        if let Some(checkpoints) = &self.inner.checkpoints {
            checkpoints.checkpoint(&state).await?;
        }

        let id = state.id.clone();
        let handle = StateHandle::new(state);
        let mut events = self.subscribe();
        let mut snapshot = self
            .execute_with_state(cancel.clone(), workflow, handle.clone())
            .await?;

        while !snapshot.status.is_terminal() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) if event.state_id() != id => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            snapshot = handle.snapshot();
        }
        Ok(snapshot)
    }

    /// Drive an existing state to completion or suspension on the current
    /// task and return the resulting snapshot.
    pub async fn execute_with_state(
        &self,
        cancel: CancellationToken,
        workflow: Arc<Workflow>,
        state: StateHandle,
    ) -> Result<WorkflowState, EngineError> {
        let id = state.id();
        self.claim(&id, workflow.clone(), state.clone(), cancel.clone())?;
        Ok(self.drive(workflow, state, cancel).await)
    }

    // -----------------------------------------------------------------------
    // Resuming runs
    // -----------------------------------------------------------------------

    /// Relaunch a persisted instance where it left off.
    pub async fn resume(&self, cancel: CancellationToken, id: &str) -> Result<(), EngineError> {
        let checkpoints = self.checkpoints()?;
        let state = checkpoints.restore(id).await?;
        if matches!(
            state.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Compensating
        ) {
            return Err(EngineError::NotResumable {
                id: id.to_string(),
                status: state.status,
            });
        }

        let workflow = self
            .workflow(&state.workflow_id)
            .ok_or_else(|| DefinitionError::UnknownWorkflow(state.workflow_id.clone()))?;

        let handle = StateHandle::new(state);
        self.claim(id, workflow.clone(), handle.clone(), cancel.clone())?;
        self.inner.approvals.remove(id);
        self.spawn_run(workflow, handle, cancel);
        tracing::info!(state_id = id, "workflow resumed");
        Ok(())
    }

    /// Rewind a persisted instance to the named checkpoint and relaunch it.
    ///
    /// Results and compensation records of steps at or after the checkpoint
    /// are dropped; those steps run again.
    pub async fn resume_from_checkpoint(
        &self,
        cancel: CancellationToken,
        id: &str,
        checkpoint: &str,
    ) -> Result<(), EngineError> {
        let checkpoints = self.checkpoints()?;
        let mut state = checkpoints.restore(id).await?;
        if state.status == WorkflowStatus::Compensating {
            return Err(EngineError::NotResumable {
                id: id.to_string(),
                status: state.status,
            });
        }

        let workflow = self
            .workflow(&state.workflow_id)
            .ok_or_else(|| DefinitionError::UnknownWorkflow(state.workflow_id.clone()))?;
        let index = *state
            .checkpoints
            .get(checkpoint)
            .ok_or_else(|| DefinitionError::UnknownCheckpoint {
                state_id: id.to_string(),
                checkpoint: checkpoint.to_string(),
            })?;

        rewind(&mut state, &workflow, index);
        let handle = StateHandle::new(state);
        self.claim(id, workflow.clone(), handle.clone(), cancel.clone())?;
        self.inner.approvals.remove(id);
        self.spawn_run(workflow, handle, cancel);
        tracing::info!(state_id = id, checkpoint, index, "workflow resumed from checkpoint");
        Ok(())
    }

    /// Resume every persisted instance left `Running` by an earlier process.
    pub async fn recover(&self, cancel: CancellationToken) -> Result<Vec<String>, EngineError> {
        let checkpoints = self.checkpoints()?;
        let orphaned = checkpoints.list_by_status(WorkflowStatus::Running).await?;

        let mut resumed = Vec::new();
        for state in orphaned {
            if self.instance(&state.id).is_some() {
                continue;
            }
            match self.resume(cancel.clone(), &state.id).await {
                Ok(()) => resumed.push(state.id),
                Err(e) => {
                    tracing::warn!(state_id = %state.id, error = %e, "could not recover workflow");
                }
            }
        }
        tracing::info!(count = resumed.len(), "recovered interrupted workflows");
        Ok(resumed)
    }

    // -----------------------------------------------------------------------
    // Signals and approvals
    // -----------------------------------------------------------------------

    /// Deliver `data` to every step currently waiting on `name`.
    pub fn send_signal(&self, name: &str, data: Value) -> usize {
        self.inner.signals.send(name, data)
    }

    /// Record an approval. Once every required approver has approved, the
    /// instance is set `Running` and relaunched at its gate.
    pub async fn approve(&self, id: &str, approver: &str) -> Result<ApprovalProgress, EngineError> {
        self.ensure_pending(id).await?;
        let progress = self.inner.approvals.approve(id, approver)?;

        match &progress {
            ApprovalProgress::Pending { votes, remaining } => {
                let instance = self
                    .instance(id)
                    .ok_or_else(|| ApprovalError::NoPendingApproval(id.to_string()))?;
                instance.state.update(|s| {
                    if let Some(pending) = s.pending_approval.as_mut() {
                        pending.votes = votes.clone();
                    }
                });
                self.persist(&instance.state).await;
                tracing::info!(
                    state_id = id,
                    approver,
                    remaining = remaining.len(),
                    "approval recorded"
                );
            }
            ApprovalProgress::Resolved(outcome) => {
                self.resolve_gate(id, outcome.clone()).await?;
            }
        }
        Ok(progress)
    }

    /// Reject the pending approval. The relaunched run fails the gate with
    /// `StepError::Rejected`.
    pub async fn reject(&self, id: &str, approver: &str, reason: &str) -> Result<(), EngineError> {
        self.ensure_pending(id).await?;
        let outcome = self.inner.approvals.reject(id, approver, reason)?;
        self.resolve_gate(id, outcome).await
    }

    /// Reject every approval whose deadline passed at `now` and return the
    /// affected state ids. Meant to be driven periodically by a scheduler.
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> Vec<String> {
        if let Some(checkpoints) = &self.inner.checkpoints {
            match checkpoints.list_by_status(WorkflowStatus::Paused).await {
                Ok(paused) => {
                    for state in paused {
                        let expired = state
                            .pending_approval
                            .as_ref()
                            .is_some_and(|p| p.outcome.is_none() && p.is_expired(now));
                        if expired && !self.inner.approvals.contains(&state.id) {
                            if let Err(e) = self.ensure_pending(&state.id).await {
                                tracing::warn!(state_id = %state.id, error = %e, "could not load expired approval");
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "could not list paused workflows"),
            }
        }

        let mut expired = Vec::new();
        for (id, outcome) in self.inner.approvals.take_expired(now) {
            tracing::info!(state_id = %id, "approval timed out");
            match self.resolve_gate(&id, outcome).await {
                Ok(()) => expired.push(id),
                Err(e) => tracing::warn!(state_id = %id, error = %e, "could not expire approval"),
            }
        }
        expired
    }

    // -----------------------------------------------------------------------
    // Inspection and control
    // -----------------------------------------------------------------------

    /// Snapshot of a live (running or paused) instance.
    pub fn get_state(&self, id: &str) -> Option<WorkflowState> {
        self.instance(id).map(|instance| instance.state.snapshot())
    }

    /// Snapshot of a live instance, else the last persisted one.
    pub async fn load_state(&self, id: &str) -> Result<Option<WorkflowState>, EngineError> {
        if let Some(state) = self.get_state(id) {
            return Ok(Some(state));
        }
        match &self.inner.checkpoints {
            Some(checkpoints) => Ok(checkpoints.find(id).await?),
            None => Ok(None),
        }
    }

    /// Ids of live instances, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_index().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel the executing task of an instance. Returns `false` when no task
    /// is executing it.
    pub fn cancel(&self, id: &str) -> bool {
        match self.instance(id) {
            Some(instance) if instance.active => {
                instance.cancel.cancel();
                tracing::info!(state_id = id, "workflow cancellation requested");
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    fn spawn_run(&self, workflow: Arc<Workflow>, state: StateHandle, cancel: CancellationToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(workflow, state, cancel).await;
        });
    }

    async fn drive(
        &self,
        workflow: Arc<Workflow>,
        state: StateHandle,
        cancel: CancellationToken,
    ) -> WorkflowState {
        let started = Instant::now();
        let state_id = state.id();
        let resumed = state.update(|s| {
            s.status = WorkflowStatus::Running;
            s.current_step > 0 || !s.step_results.is_empty()
        });

        tracing::info!(state_id = %state_id, workflow = workflow.name(), resumed, "workflow run started");
        self.inner.events.publish(WorkflowEvent::RunStarted {
            state_id: state_id.clone(),
            workflow_name: workflow.name().to_string(),
            resumed,
        });

        let runner = StepRunner {
            workflow,
            state,
            cancel,
            signals: self.inner.signals.clone(),
            events: self.inner.events.clone(),
            retry_defaults: self.inner.retry_defaults.clone(),
            approval_timeout: self
                .inner
                .config
                .default_approval_timeout_secs
                .map(Duration::from_secs),
            late_branches: self.late_branch_hook(),
            state_id,
        };

        match self.run_steps(&runner).await {
            Ok(StepOutcome::Completed) => self.complete(&runner, started).await,
            Ok(StepOutcome::Suspended) => self.suspend(&runner).await,
            Err((at, halt)) => self.fail(&runner, at, halt).await,
        }
        runner.state.snapshot()
    }

    /// Run the top-level steps from the resume position.
    ///
    /// A halt is returned with the index of the step it stopped at. A
    /// cancellation seen between steps stops at the next step without
    /// touching its position or checkpoint label.
    async fn run_steps(&self, runner: &StepRunner) -> Result<StepOutcome, (usize, Halt)> {
        let steps = runner.workflow.steps();
        let mut index = runner.state.read(|s| resume_index(s, steps));

        while index < steps.len() {
            if runner.cancel.is_cancelled() {
                return Err((index, Halt::Cancelled));
            }
            let step = &steps[index];
            runner.state.update(|s| {
                s.current_step = index;
                s.checkpoints.insert(step.name().to_string(), index);
            });
            self.save_checkpoint(runner).await.map_err(|halt| (index, halt))?;

            let outcome = match runner.execute_step(step, index).await {
                Ok(outcome) => Ok(outcome),
                Err(StepFault::Step(error)) => runner
                    .absorb_or_escalate(step.name(), error)
                    .map(|()| StepOutcome::Completed),
                Err(StepFault::Halt(halt)) => Err(halt),
            };
            match outcome.map_err(|halt| (index, halt))? {
                StepOutcome::Completed => {}
                StepOutcome::Suspended => return Ok(StepOutcome::Suspended),
            }
            index += 1;
        }
        Ok(StepOutcome::Completed)
    }

    async fn complete(&self, runner: &StepRunner, started: Instant) {
        runner.state.update(|s| {
            s.status = WorkflowStatus::Completed;
            s.completed_at = Some(Utc::now());
        });
        self.persist(&runner.state).await;
        self.settle(runner);

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(state_id = %runner.state_id, workflow = runner.workflow.name(), duration_ms, "workflow completed");
        self.inner.events.publish(WorkflowEvent::RunCompleted {
            state_id: runner.state_id.clone(),
            workflow_name: runner.workflow.name().to_string(),
            duration_ms,
        });
    }

    /// Park the instance at its approval gate and let the task exit.
    ///
    /// The paused snapshot is saved first. Only then does the status flip to
    /// `Paused`, under the index lock together with the request registration,
    /// so any reader that sees `Paused` can approve and no later save of the
    /// relaunched run can be overwritten by this one.
    async fn suspend(&self, runner: &StepRunner) {
        self.persist_with(&runner.state, |s| s.status = WorkflowStatus::Paused)
            .await;

        let pending = {
            let mut index = self.write_index();
            if let Some(instance) = index.running.get_mut(&runner.state_id) {
                instance.active = false;
            }
            let pending = runner.state.update(|s| {
                s.status = WorkflowStatus::Paused;
                s.pending_approval.clone()
            });
            if let Some(request) = &pending {
                self.inner.approvals.register(&runner.state_id, request.clone());
            }
            pending
        };

        let (step_name, reason) = match pending {
            Some(request) => {
                let approvers: Vec<&str> = request.approvers.iter().map(String::as_str).collect();
                (
                    request.step_name.clone(),
                    format!("awaiting approval from {}", approvers.join(", ")),
                )
            }
            None => (String::new(), "suspended".to_string()),
        };

        tracing::info!(state_id = %runner.state_id, step = %step_name, "workflow paused");
        self.inner.events.publish(WorkflowEvent::RunPaused {
            state_id: runner.state_id.clone(),
            step_name,
            reason,
        });
    }

    async fn fail(&self, runner: &StepRunner, at: usize, halt: Halt) {
        let compensate = match &halt {
            Halt::Failed { .. } => true,
            Halt::Cancelled => self.cancellation_escalates(runner, at),
        };

        let has_compensations = runner.state.read(|s| !s.compensations.is_empty());
        if compensate && has_compensations {
            runner.state.update(|s| s.status = WorkflowStatus::Compensating);
            self.persist(&runner.state).await;
            let report = compensation::unwind(runner, self.inner.checkpoints.as_ref()).await;
            tracing::info!(
                state_id = %runner.state_id,
                executed = report.executed,
                failed = report.failed,
                "compensation unwind finished"
            );
        }

        runner.state.update(|s| {
            s.status = WorkflowStatus::Failed;
            s.completed_at = Some(Utc::now());
        });
        self.persist(&runner.state).await;
        self.settle(runner);

        tracing::warn!(state_id = %runner.state_id, workflow = runner.workflow.name(), error = %halt, "workflow failed");
        self.inner.events.publish(WorkflowEvent::RunFailed {
            state_id: runner.state_id.clone(),
            workflow_name: runner.workflow.name().to_string(),
            error: halt.to_string(),
        });
    }

    /// Record a boundary cancellation and ask the error hook whether it
    /// should be treated as a failure that needs rollback.
    fn cancellation_escalates(&self, runner: &StepRunner, at: usize) -> bool {
        let step = runner
            .workflow
            .steps()
            .get(at)
            .map(|step| step.name().to_string())
            .unwrap_or_default();
        runner.state.push_error(format!("{step}: {}", StepError::Cancelled));
        tracing::info!(state_id = %runner.state_id, step = %step, "workflow cancelled");

        let Some(hook) = runner.workflow.error_hook() else {
            return false;
        };
        match hook(&step, &StepError::Cancelled) {
            Ok(()) => false,
            Err(escalated) => {
                if escalated != StepError::Cancelled {
                    runner.state.push_error(format!("{step}: {escalated}"));
                }
                true
            }
        }
    }

    /// Terminal bookkeeping shared by completion and failure.
    fn settle(&self, runner: &StepRunner) {
        if let Some(hook) = runner.workflow.completion_hook() {
            hook(&runner.state.snapshot());
        }
        self.write_index().running.remove(&runner.state_id);
        self.inner.approvals.remove(&runner.state_id);
    }

    /// Mid-run checkpoint; failing it is fatal only when configured so.
    async fn save_checkpoint(&self, runner: &StepRunner) -> Result<(), Halt> {
        let Some(checkpoints) = &self.inner.checkpoints else {
            return Ok(());
        };
        match checkpoints.checkpoint_handle(&runner.state).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(state_id = %runner.state_id, error = %e, "checkpoint save failed");
                runner.state.push_error(format!("checkpoint save failed: {e}"));
                if self.inner.config.fail_on_checkpoint_error {
                    Err(Halt::Failed {
                        step: "checkpoint".to_string(),
                        error: StepError::failed(e.to_string()),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Best-effort save used for transitions that must not be interrupted.
    async fn persist(&self, state: &StateHandle) {
        self.persist_with(state, |_| {}).await;
    }

    async fn persist_with(&self, state: &StateHandle, adjust: impl FnOnce(&mut WorkflowState)) {
        let Some(checkpoints) = &self.inner.checkpoints else {
            return;
        };
        if let Err(e) = checkpoints.checkpoint_handle_with(state, adjust).await {
            let (id, status) = state.read(|s| (s.id.clone(), s.status));
            tracing::warn!(state_id = %id, status = %status, error = %e, "state save failed");
            state.push_error(format!("checkpoint save failed: {e}"));
        }
    }

    /// Save hook for branches still running after their parallel step
    /// returned, so their late results reach persistence.
    fn late_branch_hook(&self) -> Option<LateBranchHook> {
        self.inner.checkpoints.as_ref()?;
        let engine = self.clone();
        Some(Arc::new(move |state: StateHandle| {
            let engine = engine.clone();
            Box::pin(async move { engine.persist(&state).await }) as BoxFuture<'static, ()>
        }))
    }

    // -----------------------------------------------------------------------
    // Approval plumbing
    // -----------------------------------------------------------------------

    /// Make sure the approval manager knows the request of `id`, loading it
    /// from the parked instance or from persistence when it does not.
    async fn ensure_pending(&self, id: &str) -> Result<(), EngineError> {
        if self.inner.approvals.contains(id) {
            return Ok(());
        }
        let no_request = || EngineError::from(ApprovalError::NoPendingApproval(id.to_string()));

        if let Some(instance) = self.instance(id) {
            let request = instance
                .state
                .read(|s| s.pending_approval.clone())
                .filter(|p| p.outcome.is_none());
            return match request {
                Some(request) if !instance.active => {
                    self.inner.approvals.register(id, request);
                    Ok(())
                }
                _ => Err(no_request()),
            };
        }

        let Some(checkpoints) = &self.inner.checkpoints else {
            return Err(no_request());
        };
        let Some(state) = checkpoints.find(id).await? else {
            return Err(no_request());
        };
        let request = match (&state.status, &state.pending_approval) {
            (WorkflowStatus::Paused, Some(pending)) if pending.outcome.is_none() => pending.clone(),
            _ => return Err(no_request()),
        };
        let workflow = self
            .workflow(&state.workflow_id)
            .ok_or_else(|| DefinitionError::UnknownWorkflow(state.workflow_id.clone()))?;

        self.park(id, workflow, StateHandle::new(state));
        self.inner.approvals.register(id, request);
        tracing::debug!(state_id = id, "approval request restored from persistence");
        Ok(())
    }

    /// Store the outcome on the parked state, mark it `Running` and
    /// relaunch it at the gate.
    async fn resolve_gate(&self, id: &str, outcome: ApprovalOutcome) -> Result<(), EngineError> {
        let instance = self
            .instance(id)
            .ok_or_else(|| ApprovalError::NoPendingApproval(id.to_string()))?;

        instance.state.update(|s| {
            if let Some(pending) = s.pending_approval.as_mut() {
                if let ApprovalOutcome::Approved { approvers } = &outcome {
                    pending.votes = approvers.iter().cloned().collect();
                }
                pending.outcome = Some(outcome.clone());
            }
            s.status = WorkflowStatus::Running;
        });
        self.persist(&instance.state).await;

        let approved = matches!(outcome, ApprovalOutcome::Approved { .. });
        tracing::info!(state_id = id, approved, "approval resolved, relaunching workflow");

        let cancel = CancellationToken::new();
        self.claim(id, instance.workflow.clone(), instance.state.clone(), cancel.clone())?;
        self.spawn_run(instance.workflow, instance.state, cancel);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Index helpers
    // -----------------------------------------------------------------------

    fn checkpoints(&self) -> Result<&CheckpointManager<R>, EngineError> {
        self.inner
            .checkpoints
            .as_ref()
            .ok_or(EngineError::Persistence(CheckpointError::NotConfigured))
    }

    fn instance(&self, id: &str) -> Option<RunningInstance> {
        self.read_index().running.get(id).cloned()
    }

    /// Mark `id` as executing, refusing if another task already executes it.
    fn claim(
        &self,
        id: &str,
        workflow: Arc<Workflow>,
        state: StateHandle,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let mut index = self.write_index();
        if index.running.get(id).is_some_and(|instance| instance.active) {
            return Err(EngineError::AlreadyRunning(id.to_string()));
        }
        index.running.insert(
            id.to_string(),
            RunningInstance {
                workflow,
                state,
                cancel,
                active: true,
            },
        );
        Ok(())
    }

    /// Track a paused instance without a task.
    fn park(&self, id: &str, workflow: Arc<Workflow>, state: StateHandle) {
        self.write_index()
            .running
            .entry(id.to_string())
            .or_insert(RunningInstance {
                workflow,
                state,
                cancel: CancellationToken::new(),
                active: false,
            });
    }

    fn read_index(&self) -> RwLockReadGuard<'_, EngineIndex> {
        self.inner.index.read().expect("engine index lock poisoned")
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, EngineIndex> {
        self.inner.index.write().expect("engine index lock poisoned")
    }
}

impl<R: StateRepository> std::fmt::Debug for Engine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (workflows, running) = self
            .inner
            .index
            .read()
            .map(|index| (index.workflows.len(), index.running.len()))
            .unwrap_or_default();
        f.debug_struct("Engine")
            .field("workflows", &workflows)
            .field("running", &running)
            .field("persistent", &self.inner.checkpoints.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// State helpers
// ---------------------------------------------------------------------------

fn new_state(workflow: &Workflow, input: HashMap<String, Value>) -> WorkflowState {
    let id = format!("{}-{}", workflow.name(), Uuid::now_v7());
    let mut state = WorkflowState::new(id, workflow.name().to_string(), input);
    state.status = WorkflowStatus::Running;
    state
}

/// First top-level step to execute: the current one unless it already left
/// a result.
fn resume_index(state: &WorkflowState, steps: &[Step]) -> usize {
    let current = state.current_step;
    match steps.get(current) {
        Some(step) if state.step_results.contains_key(step.name()) => current + 1,
        _ => current,
    }
}

/// Reset `state` so execution restarts at top-level step `index`.
fn rewind(state: &mut WorkflowState, workflow: &Workflow, index: usize) {
    let replayed = workflow.steps().get(index..).unwrap_or_default();
    for step in replayed {
        for name in step.names() {
            state.step_results.remove(name);
        }
    }
    state.checkpoints.retain(|_, i| *i <= index);
    state.compensations.retain(|record| record.step_index < index);
    if state
        .pending_approval
        .as_ref()
        .is_some_and(|pending| pending.step_index >= index)
    {
        state.pending_approval = None;
    }
    state.current_step = index;
    state.completed_at = None;
    state.status = WorkflowStatus::Running;
}
