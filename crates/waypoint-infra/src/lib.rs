//! Infrastructure layer for Waypoint.
//!
//! Implements the `StateRepository` port from `waypoint-core` on SQLite and
//! loads engine configuration from the data directory.

pub mod config;
pub mod sqlite;
