//! In-memory `StateRepository` backed by `DashMap`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{WorkflowState, WorkflowStatus};

use super::state::StateRepository;

/// Process-local state store.
///
/// Saves can be switched to fail with [`MemoryStateRepository::fail_saves`],
/// which is how callers exercise the engine's checkpoint error policy.
#[derive(Debug, Default)]
pub struct MemoryStateRepository {
    states: DashMap<String, WorkflowState>,
    fail_saves: AtomicBool,
    save_count: AtomicUsize,
}

impl MemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail (or succeed again).
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Stored copy of a state, if any.
    pub fn get(&self, id: &str) -> Option<WorkflowState> {
        self.states.get(id).map(|entry| entry.value().clone())
    }

    /// Replace a stored record directly, bypassing the failure switch.
    pub fn insert(&self, state: WorkflowState) {
        self.states.insert(state.id.clone(), state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl StateRepository for MemoryStateRepository {
    async fn save(&self, state: &WorkflowState) -> Result<(), RepositoryError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RepositoryError::Storage(format!(
                "save of '{}' rejected by failure switch",
                state.id
            )));
        }
        self.states.insert(state.id.clone(), state.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        Ok(self.get(id))
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowState>, RepositoryError> {
        let mut states: Vec<WorkflowState> = self
            .states
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect();
        states.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn state(id: &str, status: WorkflowStatus) -> WorkflowState {
        let mut state = WorkflowState::new(id.to_string(), "order".to_string(), HashMap::new());
        state.status = status;
        state
    }

    #[tokio::test]
    async fn save_overwrites_and_load_returns_copy() {
        let repo = MemoryStateRepository::new();
        let mut s = state("order-1", WorkflowStatus::Running);
        repo.save(&s).await.unwrap();

        s.current_step = 3;
        repo.save(&s).await.unwrap();

        let loaded = repo.load("order-1").await.unwrap().unwrap();
        assert_eq!(loaded.current_step, 3);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.save_count(), 2);
        assert!(repo.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_switch_rejects_saves() {
        let repo = MemoryStateRepository::new();
        repo.fail_saves(true);
        let err = repo
            .save(&state("order-1", WorkflowStatus::Running))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failure switch"));
        assert!(repo.is_empty());

        repo.fail_saves(false);
        repo.save(&state("order-1", WorkflowStatus::Running))
            .await
            .unwrap();
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let repo = MemoryStateRepository::new();
        repo.save(&state("a", WorkflowStatus::Running)).await.unwrap();
        repo.save(&state("b", WorkflowStatus::Completed)).await.unwrap();
        repo.save(&state("c", WorkflowStatus::Running)).await.unwrap();

        let running = repo.list_by_status(WorkflowStatus::Running).await.unwrap();
        let ids: Vec<&str> = running.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(running.len(), 2);
        assert!(ids.contains(&"a") && ids.contains(&"c"));
    }
}
