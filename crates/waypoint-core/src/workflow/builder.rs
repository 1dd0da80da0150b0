//! Fluent construction of workflows.
//!
//! `WorkflowBuilder` assembles the top-level chain, `Branch` assembles the
//! bodies of conditionals and parallel branches, and `ActionBuilder` carries
//! per-action options. Errors are collected while building and reported once
//! by `build()`, which never returns a partial workflow.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use waypoint_types::workflow::WorkflowState;

use super::context::{StateHandle, StepContext};
use super::definition::{CompletionHook, DefinitionError, ErrorHook, Workflow};
use super::retry::RetryPolicy;
use super::step::{
    ActionStep, ApprovalStep, Chain, Compensation, ConditionalStep, JoinPolicy, ParallelStep,
    Retry, Step, StepError, StepHandler, handler,
};

// ---------------------------------------------------------------------------
// ActionBuilder
// ---------------------------------------------------------------------------

/// Options of a single action step.
pub struct ActionBuilder {
    name: String,
    handler: StepHandler,
    retry: Retry,
    timeout: Option<Duration>,
    compensation: Option<StepHandler>,
    compensation_retry: Retry,
}

impl ActionBuilder {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext, StateHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: handler(f),
            retry: Retry::Once,
            timeout: None,
            compensation: None,
            compensation_retry: Retry::Once,
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Retry::Policy(policy);
        self
    }

    /// Retry with the engine's configured defaults.
    pub fn retry_default(mut self) -> Self {
        self.retry = Retry::EngineDefault;
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn compensate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext, StateHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.compensation = Some(handler(f));
        self
    }

    pub fn compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = Retry::Policy(policy);
        self
    }

    fn into_step(self) -> Step {
        let compensation_retry = self.compensation_retry;
        Step::Action(ActionStep {
            name: self.name,
            handler: self.handler,
            retry: self.retry,
            timeout: self.timeout,
            compensation: self.compensation.map(|handler| Compensation {
                handler,
                retry: compensation_retry,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

/// Ordered steps of a nested chain.
#[derive(Default)]
pub struct Branch {
    steps: Vec<Step>,
    error: Option<DefinitionError>,
}

impl Branch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext, StateHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.action_with(ActionBuilder::new(name, f))
    }

    pub fn action_with(mut self, action: ActionBuilder) -> Self {
        self.steps.push(action.into_step());
        self
    }

    /// Attach a compensation to the most recently added action.
    pub fn compensate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext, StateHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        match self.steps.last_mut() {
            Some(Step::Action(action)) => {
                action.compensation = Some(Compensation {
                    handler: handler(f),
                    retry: Retry::Once,
                });
            }
            _ => self.fail(DefinitionError::DanglingCompensation),
        }
        self
    }

    /// Run `then_branch` when `predicate` holds for the state, else
    /// `else_branch`.
    pub fn conditional<P, T, E>(
        mut self,
        name: impl Into<String>,
        predicate: P,
        then_branch: T,
        else_branch: E,
    ) -> Self
    where
        P: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
        T: FnOnce(Branch) -> Branch,
        E: FnOnce(Branch) -> Branch,
    {
        let then_branch = self.nest(then_branch(Branch::new()));
        let else_branch = self.nest(else_branch(Branch::new()));
        self.steps.push(Step::Conditional(ConditionalStep {
            name: name.into(),
            predicate: Arc::new(predicate),
            then_branch,
            else_branch,
        }));
        self
    }

    /// Fan out over `branches` and join according to `join`.
    pub fn parallel(
        mut self,
        name: impl Into<String>,
        join: JoinPolicy,
        branches: impl IntoIterator<Item = Branch>,
    ) -> Self {
        let branches = branches.into_iter().map(|b| self.nest(b)).collect();
        self.steps.push(Step::Parallel(ParallelStep {
            name: name.into(),
            branches,
            join,
        }));
        self
    }

    /// Pause until every listed approver approves.
    pub fn approval<I, S>(mut self, name: impl Into<String>, approvers: I, timeout: Option<Duration>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(Step::ApprovalGate(ApprovalStep {
            name: name.into(),
            approvers: approvers.into_iter().map(Into::into).collect(),
            timeout,
        }));
        self
    }

    fn fail(&mut self, err: DefinitionError) {
        self.error.get_or_insert(err);
    }

    fn nest(&mut self, branch: Branch) -> Chain {
        if let Some(err) = branch.error {
            self.fail(err);
        }
        Arc::from(branch.steps)
    }

    fn finish(self) -> Result<Vec<Step>, DefinitionError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.steps),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Entry point for defining a workflow.
pub struct WorkflowBuilder {
    name: String,
    body: Branch,
    on_complete: Option<CompletionHook>,
    on_error: Option<ErrorHook>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: Branch::new(),
            on_complete: None,
            on_error: None,
        }
    }

    pub fn action<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext, StateHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.body = self.body.action(name, f);
        self
    }

    pub fn action_with(mut self, action: ActionBuilder) -> Self {
        self.body = self.body.action_with(action);
        self
    }

    pub fn compensate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StepContext, StateHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.body = self.body.compensate(f);
        self
    }

    pub fn conditional<P, T, E>(
        mut self,
        name: impl Into<String>,
        predicate: P,
        then_branch: T,
        else_branch: E,
    ) -> Self
    where
        P: Fn(&WorkflowState) -> bool + Send + Sync + 'static,
        T: FnOnce(Branch) -> Branch,
        E: FnOnce(Branch) -> Branch,
    {
        self.body = self.body.conditional(name, predicate, then_branch, else_branch);
        self
    }

    pub fn parallel(
        mut self,
        name: impl Into<String>,
        join: JoinPolicy,
        branches: impl IntoIterator<Item = Branch>,
    ) -> Self {
        self.body = self.body.parallel(name, join, branches);
        self
    }

    pub fn approval<I, S>(mut self, name: impl Into<String>, approvers: I, timeout: Option<Duration>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.body = self.body.approval(name, approvers, timeout);
        self
    }

    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkflowState) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &StepError) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Validate and freeze the workflow.
    pub fn build(self) -> Result<Workflow, DefinitionError> {
        let steps = self.body.finish()?;
        Workflow::new(self.name, steps, self.on_complete, self.on_error)
    }
}
