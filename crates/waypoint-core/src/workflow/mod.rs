//! Durable workflow execution.
//!
//! - `builder` / `definition` / `step` -- workflow construction and validation
//! - `engine` -- registry, running-instance index and run driver
//! - `step_runner` -- dispatch for actions, conditionals, parallels and gates
//! - `compensation` -- saga unwind of the compensation stack
//! - `retry` -- retry policies with exponential backoff
//! - `checkpoint` -- snapshot persistence through a `StateRepository`
//! - `signal` / `approval` -- external input delivered to running instances

pub mod approval;
pub mod builder;
pub mod checkpoint;
mod compensation;
pub mod context;
pub mod definition;
pub mod engine;
pub mod retry;
pub mod signal;
pub mod step;
mod step_runner;

pub use approval::{ApprovalError, ApprovalManager, ApprovalProgress};
pub use builder::{ActionBuilder, Branch, WorkflowBuilder};
pub use checkpoint::{CheckpointError, CheckpointManager};
pub use context::{StateHandle, StepContext};
pub use definition::{DefinitionError, Workflow};
pub use engine::{Engine, EngineError};
pub use retry::RetryPolicy;
pub use signal::{SignalError, SignalManager};
pub use step::{JoinPolicy, Retry, Step, StepError};
