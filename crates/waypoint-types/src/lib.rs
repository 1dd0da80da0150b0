//! Shared domain types for Waypoint.
//!
//! This crate contains the records shared across the Waypoint workspace:
//! the persisted workflow state, lifecycle events, engine configuration,
//! and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
