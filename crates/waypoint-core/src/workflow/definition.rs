//! Immutable workflow definitions and their structural validation.
//!
//! A `Workflow` is produced only by `WorkflowBuilder::build`, which runs
//! `validate_steps` first, so every value of this type is structurally valid.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use waypoint_types::workflow::WorkflowState;

use super::step::{Chain, Compensation, JoinPolicy, Step, StepError};

/// Called with the final state when a run completes or fails.
pub type CompletionHook = Arc<dyn Fn(&WorkflowState) + Send + Sync>;

/// Called with a failed step's name and error. `Ok(())` absorbs the failure
/// and continues with the next step; `Err` escalates.
pub type ErrorHook = Arc<dyn Fn(&str, &StepError) -> Result<(), StepError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Invalid workflow definitions and references to unknown definitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("step name must not be empty")]
    EmptyStepName,

    #[error("duplicate step name: '{0}'")]
    DuplicateStepName(String),

    #[error("step '{0}' has an empty branch")]
    EmptyBranch(String),

    #[error("approval gate '{0}' has no approvers")]
    NoApprovers(String),

    #[error("parallel step '{step}' waits for {required} of {branches} branches")]
    InvalidJoin {
        step: String,
        required: usize,
        branches: usize,
    },

    #[error("approval gate '{0}' must be a top-level step")]
    NestedApproval(String),

    #[error("compensation declared without a preceding action")]
    DanglingCompensation,

    #[error("unknown workflow: '{0}'")]
    UnknownWorkflow(String),

    #[error("state '{state_id}' has no checkpoint '{checkpoint}'")]
    UnknownCheckpoint { state_id: String, checkpoint: String },
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A named, validated, immutable sequence of steps.
pub struct Workflow {
    name: String,
    steps: Chain,
    on_complete: Option<CompletionHook>,
    on_error: Option<ErrorHook>,
    compensations: HashMap<String, Compensation>,
}

impl Workflow {
    pub(crate) fn new(
        name: String,
        steps: Vec<Step>,
        on_complete: Option<CompletionHook>,
        on_error: Option<ErrorHook>,
    ) -> Result<Self, DefinitionError> {
        if name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if steps.is_empty() {
            return Err(DefinitionError::NoSteps(name));
        }
        validate_steps(&steps)?;

        let mut compensations = HashMap::new();
        index_compensations(&steps, &mut compensations);

        Ok(Self {
            name,
            steps: Arc::from(steps),
            on_complete,
            on_error,
            compensations,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Top-level steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Compensation of the action named `step`, wherever it is nested.
    pub fn compensation_for(&self, step: &str) -> Option<&Compensation> {
        self.compensations.get(step)
    }

    pub fn completion_hook(&self) -> Option<&CompletionHook> {
        self.on_complete.as_ref()
    }

    pub fn error_hook(&self) -> Option<&ErrorHook> {
        self.on_error.as_ref()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the structural constraints of a top-level step list.
///
/// Checks: non-empty names unique across the whole tree, non-empty
/// branches, approvers on every gate, `1 <= k <= branches` for joins, and
/// gates only at the top level.
pub fn validate_steps(steps: &[Step]) -> Result<(), DefinitionError> {
    let mut seen = HashSet::new();
    validate_chain(steps, 0, &mut seen)
}

fn validate_chain<'a>(
    steps: &'a [Step],
    depth: usize,
    seen: &mut HashSet<&'a str>,
) -> Result<(), DefinitionError> {
    for step in steps {
        let name = step.name();
        if name.trim().is_empty() {
            return Err(DefinitionError::EmptyStepName);
        }
        if !seen.insert(name) {
            return Err(DefinitionError::DuplicateStepName(name.to_string()));
        }

        match step {
            Step::Action(_) => {}
            Step::ApprovalGate(gate) => {
                if depth > 0 {
                    return Err(DefinitionError::NestedApproval(name.to_string()));
                }
                if gate.approvers.is_empty() {
                    return Err(DefinitionError::NoApprovers(name.to_string()));
                }
            }
            Step::Conditional(_) => {}
            Step::Parallel(parallel) => {
                if parallel.branches.is_empty() {
                    return Err(DefinitionError::EmptyBranch(name.to_string()));
                }
                let required = match parallel.join {
                    JoinPolicy::WaitN(k) => k,
                    other => other.required(parallel.branches.len()),
                };
                if required == 0 || required > parallel.branches.len() {
                    return Err(DefinitionError::InvalidJoin {
                        step: name.to_string(),
                        required,
                        branches: parallel.branches.len(),
                    });
                }
            }
        }

        for chain in step.children() {
            if chain.is_empty() {
                return Err(DefinitionError::EmptyBranch(name.to_string()));
            }
            validate_chain(chain, depth + 1, seen)?;
        }
    }
    Ok(())
}

fn index_compensations(steps: &[Step], index: &mut HashMap<String, Compensation>) {
    for step in steps {
        if let Step::Action(action) = step {
            if let Some(compensation) = &action.compensation {
                index.insert(action.name.clone(), compensation.clone());
            }
        }
        for chain in step.children() {
            index_compensations(chain, index);
        }
    }
}
