//! Step variants and handler types.
//!
//! `Step` is a closed tagged union: every kind of step the engine can run is
//! one variant, and the runner dispatches over it in a single match.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use waypoint_types::workflow::WorkflowState;

use super::context::{StateHandle, StepContext};
use super::retry::RetryPolicy;
use super::signal::SignalError;

/// An ordered sequence of steps (workflow body or branch body).
pub type Chain = Arc<[Step]>;

/// Action or compensation handler.
pub type StepHandler =
    Arc<dyn Fn(StepContext, StateHandle) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// Branch predicate evaluated against a state snapshot.
pub type Predicate = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

/// Box a plain async closure into a [`StepHandler`].
pub fn handler<F, Fut>(f: F) -> StepHandler
where
    F: Fn(StepContext, StateHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    Arc::new(move |ctx, state| Box::pin(f(ctx, state)))
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failure of a single step execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("rejected by {approver}: {reason}")]
    Rejected { approver: String, reason: String },

    #[error("signal error: {0}")]
    Signal(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }
}

impl From<SignalError> for StepError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::Cancelled(_) => StepError::Cancelled,
            other => StepError::Signal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Join policy
// ---------------------------------------------------------------------------

/// How a parallel step decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Every branch must succeed.
    WaitAll,
    /// The first successful branch completes the step.
    WaitAny,
    /// `k` successful branches complete the step.
    WaitN(usize),
}

impl JoinPolicy {
    /// Successful branches needed out of `branches`.
    pub fn required(self, branches: usize) -> usize {
        match self {
            JoinPolicy::WaitAll => branches,
            JoinPolicy::WaitAny => 1,
            JoinPolicy::WaitN(k) => k,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JoinPolicy::WaitAll => "wait_all",
            JoinPolicy::WaitAny => "wait_any",
            JoinPolicy::WaitN(_) => "wait_n",
        }
    }
}

// ---------------------------------------------------------------------------
// Retry selection
// ---------------------------------------------------------------------------

/// Retry behaviour declared on an action or compensation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Retry {
    /// Single attempt.
    #[default]
    Once,
    /// The engine's configured `[retry]` defaults.
    EngineDefault,
    Policy(RetryPolicy),
}

impl Retry {
    pub(crate) fn resolve(&self, defaults: &RetryPolicy) -> RetryPolicy {
        match self {
            Retry::Once => RetryPolicy::once(),
            Retry::EngineDefault => defaults.clone(),
            Retry::Policy(policy) => policy.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Undo handler registered by a successful action.
#[derive(Clone)]
pub struct Compensation {
    pub handler: StepHandler,
    pub retry: Retry,
}

#[derive(Clone)]
pub struct ActionStep {
    pub name: String,
    pub handler: StepHandler,
    pub retry: Retry,
    pub timeout: Option<Duration>,
    pub compensation: Option<Compensation>,
}

#[derive(Clone)]
pub struct ConditionalStep {
    pub name: String,
    pub predicate: Predicate,
    pub then_branch: Chain,
    pub else_branch: Chain,
}

#[derive(Clone)]
pub struct ParallelStep {
    pub name: String,
    pub branches: Vec<Chain>,
    pub join: JoinPolicy,
}

#[derive(Debug, Clone)]
pub struct ApprovalStep {
    pub name: String,
    pub approvers: BTreeSet<String>,
    /// Overrides the engine's default approval timeout.
    pub timeout: Option<Duration>,
}

/// A unit of work within a workflow.
#[derive(Clone)]
pub enum Step {
    Action(ActionStep),
    Conditional(ConditionalStep),
    Parallel(ParallelStep),
    ApprovalGate(ApprovalStep),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Action(s) => &s.name,
            Step::Conditional(s) => &s.name,
            Step::Parallel(s) => &s.name,
            Step::ApprovalGate(s) => &s.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Action(_) => "action",
            Step::Conditional(_) => "conditional",
            Step::Parallel(_) => "parallel",
            Step::ApprovalGate(_) => "approval",
        }
    }

    /// Nested chains of this step (branches of conditionals and parallels).
    pub fn children(&self) -> Vec<&Chain> {
        match self {
            Step::Conditional(s) => vec![&s.then_branch, &s.else_branch],
            Step::Parallel(s) => s.branches.iter().collect(),
            Step::Action(_) | Step::ApprovalGate(_) => Vec::new(),
        }
    }

    /// Names of this step and every step nested inside it, depth first.
    pub fn names(&self) -> Vec<&str> {
        let mut names = vec![self.name()];
        for chain in self.children() {
            for step in chain.iter() {
                names.extend(step.names());
            }
        }
        names
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Action(s) => f
                .debug_struct("Action")
                .field("name", &s.name)
                .field("retry", &s.retry)
                .field("timeout", &s.timeout)
                .field("compensated", &s.compensation.is_some())
                .finish(),
            Step::Conditional(s) => f
                .debug_struct("Conditional")
                .field("name", &s.name)
                .field("then_branch", &s.then_branch)
                .field("else_branch", &s.else_branch)
                .finish(),
            Step::Parallel(s) => f
                .debug_struct("Parallel")
                .field("name", &s.name)
                .field("join", &s.join)
                .field("branches", &s.branches)
                .finish(),
            Step::ApprovalGate(s) => fmt::Debug::fmt(s, f),
        }
    }
}
