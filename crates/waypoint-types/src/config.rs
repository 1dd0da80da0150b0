//! Engine configuration types for Waypoint.
//!
//! `EngineConfig` represents the top-level `config.toml`. Every field has a
//! default so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.waypoint/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Buffer size of each signal waiter's channel.
    #[serde(default = "default_signal_buffer")]
    pub signal_buffer: usize,

    /// Timeout applied to approval gates that declare none (None = no expiry).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_approval_timeout_secs: Option<u64>,

    /// Fail the run when a mid-run checkpoint save fails instead of logging it.
    #[serde(default)]
    pub fail_on_checkpoint_error: bool,

    /// Default retry policy for actions that declare retries without a policy.
    #[serde(default)]
    pub retry: RetryDefaults,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_signal_buffer() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            signal_buffer: default_signal_buffer(),
            default_approval_timeout_secs: None,
            fail_on_checkpoint_error: false,
            retry: RetryDefaults::default(),
        }
    }
}

/// Retry defaults (`[retry]` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefaults {
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff growth factor between attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on a single backoff delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}
