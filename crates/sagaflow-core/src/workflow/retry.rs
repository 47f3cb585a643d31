//! Retry budget and exponential backoff for step execution.
//!
//! Attempts are 1-based: the first execution of a step is attempt 1. After a
//! failed attempt `n` the executor waits `base * 2^(n-1)`, capped at `max`.

use std::time::Duration;

use sagaflow_types::config::EngineConfig;

use super::definition::Step;

/// Default number of attempts when neither the step nor the engine
/// configuration sets one.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Resolved retry settings for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first. Always >= 1.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_max,
        }
    }

    /// Resolve the policy for `step`: the step's own `retry_count` wins over
    /// the engine default.
    pub fn for_step(step: &Step, config: &EngineConfig) -> Self {
        Self::new(
            step.retry_count().unwrap_or(config.default_retry_count),
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following failed attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max);
        delay.min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self::new(
            DEFAULT_RETRY_COUNT,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
