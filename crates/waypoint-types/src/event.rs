//! Event types for the Waypoint workflow event bus.
//!
//! `WorkflowEvent` is broadcast by the engine at every lifecycle transition.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

/// Events emitted while workflow instances execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A new instance was started (or resumed).
    RunStarted {
        state_id: String,
        workflow_name: String,
        resumed: bool,
    },

    /// A step has started executing.
    StepStarted {
        state_id: String,
        step_name: String,
        step_kind: String,
    },

    /// A step completed successfully.
    StepCompleted {
        state_id: String,
        step_name: String,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        state_id: String,
        step_name: String,
        error: String,
        will_retry: bool,
    },

    /// The instance paused at an approval gate or while waiting for a signal.
    RunPaused {
        state_id: String,
        step_name: String,
        reason: String,
    },

    /// A compensation handler ran during unwind.
    CompensationExecuted {
        state_id: String,
        step_name: String,
        success: bool,
    },

    /// The instance completed successfully.
    RunCompleted {
        state_id: String,
        workflow_name: String,
        duration_ms: u64,
    },

    /// The instance failed (after any compensation unwind).
    RunFailed {
        state_id: String,
        workflow_name: String,
        error: String,
    },
}

impl WorkflowEvent {
    /// The state id every variant carries.
    pub fn state_id(&self) -> &str {
        match self {
            WorkflowEvent::RunStarted { state_id, .. }
            | WorkflowEvent::StepStarted { state_id, .. }
            | WorkflowEvent::StepCompleted { state_id, .. }
            | WorkflowEvent::StepFailed { state_id, .. }
            | WorkflowEvent::RunPaused { state_id, .. }
            | WorkflowEvent::CompensationExecuted { state_id, .. }
            | WorkflowEvent::RunCompleted { state_id, .. }
            | WorkflowEvent::RunFailed { state_id, .. } => state_id,
        }
    }

    /// Whether the event ends the current execution of an instance
    /// (completion, failure, or a pause that exits the executing task).
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::RunCompleted { .. }
                | WorkflowEvent::RunFailed { .. }
                | WorkflowEvent::RunPaused { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_started_serde_roundtrip() {
        let event = WorkflowEvent::RunStarted {
            state_id: "order-1".to_string(),
            workflow_name: "order".to_string(),
            resumed: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"run_started\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_step_failed_serde_roundtrip() {
        let event = WorkflowEvent::StepFailed {
            state_id: "order-1".to_string(),
            step_name: "charge".to_string(),
            error: "card declined".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"will_retry\":true"));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WorkflowEvent::StepFailed { will_retry: true, .. }));
    }

    #[test]
    fn test_state_id_and_settled() {
        let paused = WorkflowEvent::RunPaused {
            state_id: "expense-7".to_string(),
            step_name: "review".to_string(),
            reason: "awaiting approval".to_string(),
        };
        assert_eq!(paused.state_id(), "expense-7");
        assert!(paused.is_settled());

        let step = WorkflowEvent::StepStarted {
            state_id: "expense-7".to_string(),
            step_name: "submit".to_string(),
            step_kind: "action".to_string(),
        };
        assert!(!step.is_settled());
    }
}
