use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{PgConnectionConfig, ValidationError};

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_fetch_size() -> i64 {
    500
}

/// A Postgres database whose changes are recorded by trigger into `cdcflow.change_log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogSourceConfig {
    pub connection: PgConnectionConfig,
    /// How long to wait before polling again once the log is drained.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum number of change rows fetched per query.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: i64,
}

impl ChangeLogSourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::TimeoutZero("source.poll_interval_ms"));
        }

        self.connection.validate()
    }
}
