//! Workflow state repository trait definition.
//!
//! The engine persists whole `WorkflowState` snapshots through this port. The
//! infrastructure layer (waypoint-infra) implements it with SQLite; the
//! in-memory implementation in `repository::memory` serves embedding and tests.

use std::future::Future;
use std::sync::Arc;

use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{WorkflowState, WorkflowStatus};

/// Storage backend for workflow instance state.
///
/// `save` is a full overwrite of the record keyed by `state.id`. Uses native
/// async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateRepository: Send + Sync {
    /// Insert or replace the state record.
    fn save(&self, state: &WorkflowState) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a state by id. `Ok(None)` when no record exists.
    fn load(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<WorkflowState>, RepositoryError>> + Send;

    /// List states in the given status, oldest first.
    ///
    /// Backends that cannot enumerate return an empty list, which disables
    /// crash recovery for them.
    fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> impl Future<Output = Result<Vec<WorkflowState>, RepositoryError>> + Send {
        let _ = status;
        async { Ok(Vec::new()) }
    }
}

impl<R: StateRepository> StateRepository for Arc<R> {
    fn save(&self, state: &WorkflowState) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save(state)
    }

    fn load(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<WorkflowState>, RepositoryError>> + Send {
        (**self).load(id)
    }

    fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> impl Future<Output = Result<Vec<WorkflowState>, RepositoryError>> + Send {
        (**self).list_by_status(status)
    }
}

/// Placeholder backend for engines built without persistence.
///
/// `Engine::new` uses it so the engine type stays generic over its repository
/// even when nothing is stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unpersisted;

impl StateRepository for Unpersisted {
    async fn save(&self, _state: &WorkflowState) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn load(&self, _id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        Ok(None)
    }
}
