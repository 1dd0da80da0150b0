//! Workflow engine core for Waypoint.
//!
//! Defines workflows, executes them step by step with retries, parallel
//! fan-out, approval gates and saga compensation, and checkpoints every
//! instance through the `StateRepository` port that the infrastructure layer
//! implements. Depends only on `waypoint-types`, never on `waypoint-infra`.

pub mod event;
pub mod repository;
pub mod workflow;
