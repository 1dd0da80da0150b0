//! Lifecycle event distribution.
//!
//! Provides an `EventBus` that fans `WorkflowEvent` messages out to every
//! subscriber via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
