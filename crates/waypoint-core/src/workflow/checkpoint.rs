//! Durable checkpoint manager for workflow instance state.
//!
//! Wraps a `StateRepository` with logging and error mapping. The engine saves
//! a full state snapshot before every top-level step, after every
//! compensation and at every terminal or suspended transition, so a crashed
//! instance can be resumed from its last recorded position.

use waypoint_types::workflow::{WorkflowState, WorkflowStatus};

use super::context::StateHandle;
use crate::repository::state::StateRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists workflow state snapshots.
///
/// Generic over `R: StateRepository` so it works with any storage backend
/// (SQLite, in-memory, test doubles).
pub struct CheckpointManager<R: StateRepository> {
    repo: R,
}

impl<R: StateRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Save a full snapshot of `state`.
    pub async fn checkpoint(&self, state: &WorkflowState) -> Result<(), CheckpointError> {
        self.repo
            .save(state)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            state_id = %state.id,
            status = %state.status,
            current_step = state.current_step,
            "checkpointed workflow state"
        );
        Ok(())
    }

    /// Save the current state of a live instance.
    pub async fn checkpoint_handle(&self, state: &StateHandle) -> Result<(), CheckpointError> {
        self.checkpoint_handle_with(state, |_| {}).await
    }

    /// Save the current state of a live instance with `adjust` applied to
    /// the saved copy only. Saves of one instance land in snapshot order.
    pub async fn checkpoint_handle_with(
        &self,
        state: &StateHandle,
        adjust: impl FnOnce(&mut WorkflowState),
    ) -> Result<(), CheckpointError> {
        let _order = state.save_guard().await;
        let mut snapshot = state.snapshot();
        adjust(&mut snapshot);
        self.checkpoint(&snapshot).await
    }

    /// Load the last saved snapshot of `id`.
    pub async fn restore(&self, id: &str) -> Result<WorkflowState, CheckpointError> {
        self.repo
            .load(id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or_else(|| CheckpointError::StateNotFound(id.to_string()))
    }

    /// Load a snapshot if one exists.
    pub async fn find(&self, id: &str) -> Result<Option<WorkflowState>, CheckpointError> {
        self.repo
            .load(id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Snapshots currently in `status`.
    pub async fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowState>, CheckpointError> {
        self.repo
            .list_by_status(status)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("workflow state not found: {0}")]
    StateNotFound(String),

    /// The engine was built without a repository.
    #[error("no persistence backend configured")]
    NotConfigured,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
