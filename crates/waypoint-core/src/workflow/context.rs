//! Live state handle and per-step execution context.
//!
//! `StateHandle` wraps an instance's `WorkflowState` in the per-instance lock.
//! All mutation goes through short closures so the lock is never held across
//! an `.await`. `StepContext` is what a handler sees of the engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use waypoint_types::workflow::{WorkflowState, WorkflowStatus};

use super::signal::SignalManager;
use super::step::StepError;

// ---------------------------------------------------------------------------
// StateHandle
// ---------------------------------------------------------------------------

/// Shared, locked view of one instance's state.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<Mutex<WorkflowState>>,
    signal_waits: Arc<AtomicUsize>,
    save_order: Arc<tokio::sync::Mutex<()>>,
}

impl StateHandle {
    pub fn new(state: WorkflowState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            signal_waits: Arc::new(AtomicUsize::new(0)),
            save_order: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Serializes saves of this instance. A snapshot taken while holding the
    /// guard is never overwritten by an older one.
    pub(crate) async fn save_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.save_order.lock().await
    }

    fn lock(&self) -> MutexGuard<'_, WorkflowState> {
        self.inner.lock().expect("workflow state lock poisoned")
    }

    /// Read under the lock.
    pub fn read<T>(&self, f: impl FnOnce(&WorkflowState) -> T) -> T {
        f(&self.lock())
    }

    /// Mutate under the lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut WorkflowState) -> T) -> T {
        f(&mut self.lock())
    }

    /// Deep copy of the current state.
    pub fn snapshot(&self) -> WorkflowState {
        self.lock().clone()
    }

    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.lock().status
    }

    /// Read a workflow variable.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().data.get(key).cloned()
    }

    /// Write a workflow variable.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.lock().data.insert(key.into(), value);
    }

    pub fn step_result(&self, step: &str) -> Option<Value> {
        self.lock().step_results.get(step).cloned()
    }

    pub fn set_step_result(&self, step: impl Into<String>, value: Value) {
        self.lock().step_results.insert(step.into(), value);
    }

    /// Append to the error history.
    pub fn push_error(&self, message: impl Into<String>) {
        self.lock().errors.push(message.into());
    }

    // Paused while at least one step of the instance waits on a signal.
    fn enter_signal_wait(&self) {
        if self.signal_waits.fetch_add(1, Ordering::SeqCst) == 0 {
            self.update(|s| {
                if s.status == WorkflowStatus::Running {
                    s.status = WorkflowStatus::Paused;
                }
            });
        }
    }

    fn leave_signal_wait(&self) {
        if self.signal_waits.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.update(|s| {
                if s.status == WorkflowStatus::Paused && s.pending_approval.is_none() {
                    s.status = WorkflowStatus::Running;
                }
            });
        }
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("StateHandle")
            .field("id", &state.id)
            .field("status", &state.status)
            .field("current_step", &state.current_step)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Execution context handed to action and compensation handlers.
#[derive(Clone)]
pub struct StepContext {
    step_name: String,
    attempt: u32,
    cancel: CancellationToken,
    signals: SignalManager,
    state: StateHandle,
    state_id: String,
}

impl StepContext {
    pub(crate) fn new(
        step_name: &str,
        attempt: u32,
        cancel: CancellationToken,
        signals: SignalManager,
        state: StateHandle,
    ) -> Self {
        let state_id = state.id();
        Self {
            step_name: step_name.to_string(),
            attempt,
            cancel,
            signals,
            state,
            state_id,
        }
    }

    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record this step's result (replaces any earlier one).
    pub fn set_result(&self, value: Value) {
        self.state.set_step_result(self.step_name.clone(), value);
    }

    /// Wait for the named signal and return its payload.
    ///
    /// The instance reports `Paused` while waiting and `Running` again once
    /// the signal arrives. The state lock is not held while waiting.
    pub async fn wait_signal(&self, name: &str) -> Result<Value, StepError> {
        tracing::info!(
            state_id = %self.state_id,
            step = %self.step_name,
            signal = name,
            "waiting for signal"
        );
        self.state.enter_signal_wait();
        let result = self.signals.wait(&self.cancel, name).await;
        self.state.leave_signal_wait();
        result.map_err(StepError::from)
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("state_id", &self.state_id)
            .field("step_name", &self.step_name)
            .field("attempt", &self.attempt)
            .finish()
    }
}
