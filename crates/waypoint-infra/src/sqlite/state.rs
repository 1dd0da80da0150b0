//! SQLite workflow state repository.
//!
//! Implements `StateRepository` from `waypoint-core`. Every save upserts the
//! full state row; collections are stored as JSON text columns so a row is
//! always a complete snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use waypoint_core::repository::StateRepository;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{WorkflowState, WorkflowStatus};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `StateRepository`.
#[derive(Clone)]
pub struct SqliteStateRepository {
    pool: DatabasePool,
}

impl SqliteStateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Delete a stored state. Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_states WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    /// Most recently started states, newest first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<WorkflowState>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM workflow_states ORDER BY started_at DESC, id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        rows.iter().map(StateRow::decode).collect()
    }
}

const COLUMNS: &str = "id, workflow_id, status, current_step, data, step_results, checkpoints, \
                       compensations, errors, pending_approval, started_at, completed_at";

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct StateRow {
    id: String,
    workflow_id: String,
    status: String,
    current_step: i64,
    data: String,
    step_results: String,
    checkpoints: String,
    compensations: String,
    errors: String,
    pending_approval: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl StateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            data: row.try_get("data")?,
            step_results: row.try_get("step_results")?,
            checkpoints: row.try_get("checkpoints")?,
            compensations: row.try_get("compensations")?,
            errors: row.try_get("errors")?,
            pending_approval: row.try_get("pending_approval")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowState, RepositoryError> {
        Self::from_row(row)
            .map_err(|e| RepositoryError::Corrupt(e.to_string()))?
            .into_state()
    }

    fn into_state(self) -> Result<WorkflowState, RepositoryError> {
        let status = self
            .status
            .parse::<WorkflowStatus>()
            .map_err(RepositoryError::Corrupt)?;

        Ok(WorkflowState {
            status,
            current_step: usize::try_from(self.current_step)
                .map_err(|_| RepositoryError::Corrupt(format!("invalid current_step: {}", self.current_step)))?,
            data: from_json("data", &self.data)?,
            step_results: from_json("step_results", &self.step_results)?,
            checkpoints: from_json("checkpoints", &self.checkpoints)?,
            compensations: from_json("compensations", &self.compensations)?,
            errors: from_json("errors", &self.errors)?,
            pending_approval: self
                .pending_approval
                .as_deref()
                .map(|s| from_json("pending_approval", s))
                .transpose()?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            id: self.id,
            workflow_id: self.workflow_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_json<T: Serialize + ?Sized>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Storage(format!("serialize {column}: {e}")))
}

fn from_json<T: DeserializeOwned>(column: &str, s: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Corrupt(format!("invalid {column} JSON: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Corrupt(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// StateRepository impl
// ---------------------------------------------------------------------------

impl StateRepository for SqliteStateRepository {
    async fn save(&self, state: &WorkflowState) -> Result<(), RepositoryError> {
        let pending_approval = state
            .pending_approval
            .as_ref()
            .map(|p| to_json("pending_approval", p))
            .transpose()?;
        let current_step = i64::try_from(state.current_step)
            .map_err(|_| RepositoryError::Storage(format!("current_step out of range: {}", state.current_step)))?;

        sqlx::query(
            r#"INSERT INTO workflow_states
                 (id, workflow_id, status, current_step, data, step_results, checkpoints,
                  compensations, errors, pending_approval, started_at, completed_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 workflow_id = excluded.workflow_id,
                 status = excluded.status,
                 current_step = excluded.current_step,
                 data = excluded.data,
                 step_results = excluded.step_results,
                 checkpoints = excluded.checkpoints,
                 compensations = excluded.compensations,
                 errors = excluded.errors,
                 pending_approval = excluded.pending_approval,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&state.id)
        .bind(&state.workflow_id)
        .bind(state.status.as_str())
        .bind(current_step)
        .bind(to_json("data", &state.data)?)
        .bind(to_json("step_results", &state.step_results)?)
        .bind(to_json("checkpoints", &state.checkpoints)?)
        .bind(to_json("compensations", &state.compensations)?)
        .bind(to_json("errors", &state.errors)?)
        .bind(pending_approval)
        .bind(format_datetime(&state.started_at))
        .bind(state.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowState>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM workflow_states WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        row.as_ref().map(StateRow::decode).transpose()
    }

    async fn list_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowState>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM workflow_states WHERE status = ? ORDER BY started_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        rows.iter().map(StateRow::decode).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use serde_json::json;
    use waypoint_types::workflow::{ApprovalOutcome, CompensationRecord, PendingApproval};

    use super::*;

    async fn test_repo() -> (SqliteStateRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteStateRepository::new(pool), dir)
    }

    fn sample_state(id: &str, status: WorkflowStatus) -> WorkflowState {
        let mut state = WorkflowState::new(
            id.to_string(),
            "order".to_string(),
            HashMap::from([("order_id".to_string(), json!("o-17"))]),
        );
        state.status = status;
        state
    }

    #[tokio::test]
    async fn test_save_and_load_full_snapshot() {
        let (repo, _dir) = test_repo().await;
        let now = Utc::now();
        let mut state = sample_state("order-1", WorkflowStatus::Paused);
        state.current_step = 2;
        state.step_results.insert("charge".to_string(), json!({ "amount": 42 }));
        state.checkpoints.insert("charge".to_string(), 1);
        state.compensations.push(CompensationRecord {
            step_name: "charge".to_string(),
            step_index: 1,
        });
        state.errors.push("ship: carrier unavailable".to_string());
        state.pending_approval = Some(PendingApproval {
            step_name: "review".to_string(),
            step_index: 2,
            approvers: BTreeSet::from(["m1".to_string(), "m2".to_string()]),
            votes: BTreeSet::from(["m1".to_string()]),
            requested_at: now,
            expires_at: Some(now + chrono::Duration::hours(1)),
            outcome: None,
        });

        repo.save(&state).await.unwrap();
        let loaded = repo.load("order-1").await.unwrap().unwrap();

        assert_eq!(loaded.status, WorkflowStatus::Paused);
        assert_eq!(loaded.current_step, 2);
        assert_eq!(loaded.data, state.data);
        assert_eq!(loaded.step_results, state.step_results);
        assert_eq!(loaded.checkpoints, state.checkpoints);
        assert_eq!(loaded.compensations, state.compensations);
        assert_eq!(loaded.errors, state.errors);
        let pending = loaded.pending_approval.unwrap();
        assert_eq!(pending.remaining(), vec!["m2".to_string()]);
        assert!(pending.expires_at.is_some());
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_whole_row() {
        let (repo, _dir) = test_repo().await;
        let mut state = sample_state("order-2", WorkflowStatus::Paused);
        state.pending_approval = Some(PendingApproval {
            step_name: "review".to_string(),
            step_index: 0,
            approvers: BTreeSet::from(["m1".to_string()]),
            votes: BTreeSet::new(),
            requested_at: Utc::now(),
            expires_at: None,
            outcome: Some(ApprovalOutcome::Approved {
                approvers: vec!["m1".to_string()],
            }),
        });
        repo.save(&state).await.unwrap();

        state.pending_approval = None;
        state.status = WorkflowStatus::Completed;
        state.completed_at = Some(Utc::now());
        repo.save(&state).await.unwrap();

        let loaded = repo.load("order-2").await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Completed);
        assert!(loaded.pending_approval.is_none());
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let (repo, _dir) = test_repo().await;
        assert!(repo.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_row_is_corrupt() {
        let (repo, _dir) = test_repo().await;
        repo.save(&sample_state("order-x", WorkflowStatus::Running)).await.unwrap();
        sqlx::query("UPDATE workflow_states SET data = 'not json' WHERE id = ?")
            .bind("order-x")
            .execute(&repo.pool.writer)
            .await
            .unwrap();

        let err = repo.load("order-x").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Corrupt(ref msg) if msg.contains("data")));
    }

    #[tokio::test]
    async fn test_list_by_status_and_recent() {
        let (repo, _dir) = test_repo().await;
        let mut older = sample_state("order-a", WorkflowStatus::Running);
        older.started_at = Utc::now() - chrono::Duration::minutes(5);
        repo.save(&older).await.unwrap();
        repo.save(&sample_state("order-b", WorkflowStatus::Running)).await.unwrap();
        repo.save(&sample_state("order-c", WorkflowStatus::Failed)).await.unwrap();

        let running = repo.list_by_status(WorkflowStatus::Running).await.unwrap();
        let ids: Vec<&str> = running.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["order-a", "order-b"]);

        let recent = repo.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_ne!(recent[0].id, "order-a");

        assert!(repo.delete("order-c").await.unwrap());
        assert!(!repo.delete("order-c").await.unwrap());
        assert!(repo.list_by_status(WorkflowStatus::Failed).await.unwrap().is_empty());
    }
}
