use serde::{Deserialize, Serialize};

use crate::shared::{PgConnectionConfig, ValidationError};

/// Where checkpoints, outbox records and dead letters are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateStoreConfig {
    /// In-process state, lost on exit. Only suitable for development.
    Memory,
    Postgres { connection: PgConnectionConfig },
}

impl StateStoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Memory => Ok(()),
            Self::Postgres { connection } => connection.validate(),
        }
    }
}
