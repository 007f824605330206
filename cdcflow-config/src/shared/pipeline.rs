use serde::{Deserialize, Serialize};

use crate::shared::{CaptureConfig, OutboxRelayConfig, RetryConfig, SourceId, ValidationError};

/// Configuration of the pipeline serving one change source.
///
/// Workflows are not part of it: they come from a configuration store and can change
/// while the pipeline runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source_id: SourceId,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub outbox_relay: OutboxRelayConfig,
    /// Retries of checkpoint and outbox writes failing with a transient state store error.
    #[serde(default)]
    pub store_retry: RetryConfig,
}

impl PipelineConfig {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            capture: CaptureConfig::default(),
            outbox_relay: OutboxRelayConfig::default(),
            store_retry: RetryConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_id.as_str().is_empty() {
            return Err(ValidationError::EmptyIdentifier("source_id"));
        }

        self.capture.validate()?;
        self.outbox_relay.validate()?;
        self.store_retry.validate("store_retry")?;

        Ok(())
    }
}
