//! Bounded retry with exponential backoff.
//!
//! `RetryPolicy` is shared by actions and compensations. The decision logic
//! (`should_retry`, `backoff_for`) is pure; `retry_with_policy` drives an
//! operation through the policy and observes cancellation while backing off.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use waypoint_types::config::RetryDefaults;

use super::step::StepError;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How many times to attempt a step and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Growth factor applied to the delay after each failure.
    pub multiplier: f64,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Policy with `max_attempts` and the default backoff curve.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1)
    }

    /// Retries without any delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.multiplier = multiplier;
        self.max_backoff = max;
        self
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after failed `attempt` (1-based) before the next one.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        let capped = delay.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryDefaults::default())
    }
}

impl From<&RetryDefaults> for RetryPolicy {
    fn from(defaults: &RetryDefaults) -> Self {
        Self {
            max_attempts: defaults.max_attempts,
            initial_backoff: Duration::from_millis(defaults.initial_backoff_ms),
            multiplier: defaults.multiplier,
            max_backoff: Duration::from_millis(defaults.max_backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run `attempt_fn` until it succeeds or `policy` is exhausted.
///
/// `attempt_fn` receives the 1-based attempt number. `on_failure` is told
/// about every failed attempt and whether another one follows. Cancelled
/// and rejected steps are never retried, and cancellation during a backoff
/// sleep ends the loop with `StepError::Cancelled`.
pub async fn retry_with_policy<F, Fut, N>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
    mut on_failure: N,
) -> Result<(), StepError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), StepError>>,
    N: FnMut(u32, &StepError, bool),
{
    let mut attempt = 1;
    loop {
        let err = match attempt_fn(attempt).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let retryable = !matches!(err, StepError::Cancelled | StepError::Rejected { .. });
        let will_retry = retryable && policy.should_retry(attempt) && !cancel.is_cancelled();
        on_failure(attempt, &err, will_retry);
        if !will_retry {
            return Err(err);
        }

        let delay = policy.backoff_for(attempt);
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        attempt += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
