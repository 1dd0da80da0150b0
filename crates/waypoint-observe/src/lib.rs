//! Observability setup for Waypoint: structured logging through
//! `tracing-subscriber` with optional OpenTelemetry span export.

pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
