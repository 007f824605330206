use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cool_down_ms() -> u64 {
    30_000
}

/// Circuit breaker settings for a delivery endpoint.
///
/// After `failure_threshold` consecutive retryable failures the circuit opens and every
/// delivery to that endpoint fails fast until `cool_down_ms` elapses, after which a single
/// probe is let through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.failure_threshold == 0 {
            return Err(ValidationError::CircuitBreakerThresholdZero);
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_ms: default_cool_down_ms(),
        }
    }
}
