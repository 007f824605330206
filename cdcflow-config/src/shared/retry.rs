use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Bounded exponential backoff policy.
///
/// Attempt `n` (1-based) waits `initial_delay_ms * backoff_factor^(n-1)` before the next
/// attempt, capped at `max_delay_ms`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Ceiling for the delay between attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f32,
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validates the policy; `scope` names the owning section in error messages.
    pub fn validate(&self, scope: &'static str) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::RetryMaxAttemptsZero(scope));
        }

        if self.backoff_factor < 1.0 {
            return Err(ValidationError::RetryBackoffFactorTooSmall(scope));
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ValidationError::RetryDelayOutOfRange(scope));
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}
