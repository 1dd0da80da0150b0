//! In-memory registry of pending approval requests.
//!
//! The manager only tracks votes. Resolving a request hands the outcome back
//! to the engine, which stores it on the state and relaunches the run.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use waypoint_types::workflow::{ApprovalOutcome, PendingApproval};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("no pending approval for state '{0}'")]
    NoPendingApproval(String),

    #[error("'{approver}' is not an approver of state '{state_id}'")]
    NotAnApprover { state_id: String, approver: String },
}

/// Result of recording a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalProgress {
    /// More approvals are required.
    Pending {
        votes: BTreeSet<String>,
        remaining: Vec<String>,
    },
    /// The request is resolved and has been removed from the manager.
    Resolved(ApprovalOutcome),
}

/// Pending approval requests keyed by state id.
#[derive(Clone, Default)]
pub struct ApprovalManager {
    pending: Arc<Mutex<HashMap<String, PendingApproval>>>,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request, replacing any earlier one for the same state.
    pub fn register(&self, state_id: &str, request: PendingApproval) {
        tracing::debug!(
            state_id,
            gate = %request.step_name,
            approvers = request.approvers.len(),
            "approval requested"
        );
        self.lock().insert(state_id.to_string(), request);
    }

    pub fn get(&self, state_id: &str) -> Option<PendingApproval> {
        self.lock().get(state_id).cloned()
    }

    pub fn contains(&self, state_id: &str) -> bool {
        self.lock().contains_key(state_id)
    }

    /// Drop the request for a state (e.g. when it is rewound).
    pub fn remove(&self, state_id: &str) -> Option<PendingApproval> {
        self.lock().remove(state_id)
    }

    /// Record an approval. Voting twice is harmless.
    pub fn approve(&self, state_id: &str, approver: &str) -> Result<ApprovalProgress, ApprovalError> {
        let mut pending = self.lock();
        let request = pending
            .get_mut(state_id)
            .ok_or_else(|| ApprovalError::NoPendingApproval(state_id.to_string()))?;
        if !request.approvers.contains(approver) {
            return Err(ApprovalError::NotAnApprover {
                state_id: state_id.to_string(),
                approver: approver.to_string(),
            });
        }

        request.votes.insert(approver.to_string());
        let remaining = request.remaining();
        if !remaining.is_empty() {
            return Ok(ApprovalProgress::Pending {
                votes: request.votes.clone(),
                remaining,
            });
        }

        let approvers = request.votes.iter().cloned().collect();
        pending.remove(state_id);
        Ok(ApprovalProgress::Resolved(ApprovalOutcome::Approved { approvers }))
    }

    /// Reject the request. A single rejection resolves it.
    pub fn reject(
        &self,
        state_id: &str,
        approver: &str,
        reason: &str,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let mut pending = self.lock();
        let request = pending
            .get(state_id)
            .ok_or_else(|| ApprovalError::NoPendingApproval(state_id.to_string()))?;
        if !request.approvers.contains(approver) {
            return Err(ApprovalError::NotAnApprover {
                state_id: state_id.to_string(),
                approver: approver.to_string(),
            });
        }
        pending.remove(state_id);
        Ok(ApprovalOutcome::Rejected {
            approver: approver.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Remove every request that expired at `now` and return their
    /// rejections.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<(String, ApprovalOutcome)> {
        let mut pending = self.lock();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, request)| request.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .map(|id| {
                pending.remove(&id);
                let outcome = ApprovalOutcome::Rejected {
                    approver: "system".to_string(),
                    reason: "approval timed out".to_string(),
                };
                (id, outcome)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingApproval>> {
        self.pending.lock().expect("approval registry lock poisoned")
    }
}

impl std::fmt::Debug for ApprovalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalManager")
            .field("pending", &self.len())
            .finish()
    }
}
