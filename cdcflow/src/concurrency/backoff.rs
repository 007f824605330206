use std::time::Duration;

use cdcflow_config::shared::RetryConfig;
use rand::Rng;

/// Share of the delay added as random jitter, at most.
const JITTER_RATIO: f64 = 0.3;

/// Exponential backoff derived from a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    jitter: bool,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            jitter: true,
        }
    }

    /// Backoff without jitter, for callers that need predictable delays.
    pub fn without_jitter(config: RetryConfig) -> Self {
        Self {
            config,
            jitter: false,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.config.max_attempts
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    ///
    /// `initial_delay * factor^(attempt - 1)`, capped at `max_delay`, plus up to 30% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = f64::from(self.config.backoff_factor).powi(exponent);
        let base_delay_ms = self.config.initial_delay_ms as f64 * multiplier;
        let capped_delay_ms = base_delay_ms.min(self.config.max_delay_ms as f64);

        let delay_ms = if self.jitter {
            let jitter_factor = rand::rng().random::<f64>() * JITTER_RATIO;
            capped_delay_ms * (1.0 + jitter_factor)
        } else {
            capped_delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}
