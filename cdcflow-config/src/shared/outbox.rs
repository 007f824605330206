use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_batch_size() -> usize {
    10
}

/// Settings for the outbox relay of exactly-once workflows.
///
/// Attempts and backoff for relayed deliveries follow the workflow's `delivery.retry`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRelayConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum number of records fetched per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl OutboxRelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::OutboxBatchSizeZero);
        }

        if self.poll_interval_ms == 0 {
            return Err(ValidationError::TimeoutZero("outbox_relay.poll_interval_ms"));
        }

        Ok(())
    }
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}
