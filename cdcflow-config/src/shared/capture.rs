use serde::{Deserialize, Serialize};

use crate::shared::{RetryConfig, ValidationError};

/// What capture does when a source has no stored checkpoint yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialSnapshotPolicy {
    /// Read every change the source still retains.
    #[default]
    Full,
    /// Start after the newest change currently in the source.
    Latest,
}

/// Settings for the capture adapter of a single source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub initial_snapshot: InitialSnapshotPolicy,
    /// Reconnection policy for transient source errors. Once exhausted the source is
    /// considered failed and every workflow on it stops.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.retry.validate("capture.retry")
    }
}
