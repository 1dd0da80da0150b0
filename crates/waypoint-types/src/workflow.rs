//! Workflow execution records for Waypoint.
//!
//! `WorkflowState` is the persisted shape of one workflow instance. The engine
//! mutates a live copy behind a per-instance lock and hands full snapshots of
//! it to the persistence backend, which stores them as whole-record overwrites.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    /// Waiting on an approval gate or a signal.
    Paused,
    /// Unwinding compensations after an unrecovered failure.
    Compensating,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Whether the status is final (`Completed` or `Failed`).
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Compensating => "compensating",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "compensating" => Ok(WorkflowStatus::Compensating),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Compensation records
// ---------------------------------------------------------------------------

/// A compensation registered by a successful action.
///
/// Only the step name is persisted; the handler itself is looked up in the
/// workflow definition when the stack is unwound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// Name of the action whose forward execution succeeded.
    pub step_name: String,
    /// Index of the top-level step that contained the action.
    pub step_index: usize,
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// Resolution of an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// Every required approver voted in favour.
    Approved { approvers: Vec<String> },
    /// A single approver rejected the request.
    Rejected { approver: String, reason: String },
}

/// Approval request attached to a state paused at a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Name of the approval gate step.
    pub step_name: String,
    /// Top-level index of the gate.
    pub step_index: usize,
    /// Everyone who must approve.
    pub approvers: BTreeSet<String>,
    /// Approvers who have already approved.
    #[serde(default)]
    pub votes: BTreeSet<String>,
    pub requested_at: DateTime<Utc>,
    /// When the gate expires (None = never).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Set once the request is resolved, consumed by the resumed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ApprovalOutcome>,
}

impl PendingApproval {
    /// Approvers who still have to vote.
    pub fn remaining(&self) -> Vec<String> {
        self.approvers.difference(&self.votes).cloned().collect()
    }

    /// Whether the request expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// One execution instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// `"<workflow name>-<uuid v7>"`.
    pub id: String,
    /// Name of the workflow definition being executed.
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Workflow variables read and written by step handlers.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Results keyed by step name.
    #[serde(default)]
    pub step_results: HashMap<String, serde_json::Value>,
    /// Index of the top-level step being (or last) executed.
    #[serde(default)]
    pub current_step: usize,
    /// Checkpoint label -> top-level step index.
    #[serde(default)]
    pub checkpoints: HashMap<String, usize>,
    /// Compensation stack, oldest first.
    #[serde(default)]
    pub compensations: Vec<CompensationRecord>,
    /// Ordered error history.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Create a new `Pending` state with `data` as its initial variables.
    pub fn new(
        id: String,
        workflow_id: String,
        data: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id,
            workflow_id,
            status: WorkflowStatus::Pending,
            data,
            step_results: HashMap::new(),
            current_step: 0,
            checkpoints: HashMap::new(),
            compensations: Vec::new(),
            errors: Vec::new(),
            pending_approval: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Read a workflow variable.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
