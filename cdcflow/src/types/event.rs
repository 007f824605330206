use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::types::SourceId;

/// Schema version written into every [`ChangeEventEnvelope`].
pub const CHANGE_EVENT_SCHEMA_VERSION: u32 = 1;

/// Source assigned position of a change.
///
/// Tokens are strictly increasing within a source and are what checkpoints store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceToken(u64);

impl SequenceToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Number of positions between `self` and a later token.
    pub fn distance_to(self, later: SequenceToken) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceToken {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl TryFrom<i64> for SequenceToken {
    type Error = FlowError;

    fn try_from(value: i64) -> FlowResult<Self> {
        Ok(Self(u64::try_from(value)?))
    }
}

impl TryFrom<SequenceToken> for i64 {
    type Error = FlowError;

    fn try_from(value: SequenceToken) -> FlowResult<Self> {
        Ok(i64::try_from(value.0)?)
    }
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = FlowError;

    fn from_str(value: &str) -> FlowResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown change operation",
                format!("operation `{other}` is not one of insert, update or delete")
            ),
        }
    }
}

/// Column values of a row, keyed by column name.
pub type RowImage = serde_json::Map<String, serde_json::Value>;

/// A single row change observed in a source.
///
/// Events are never mutated once captured; fan-out shares them behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub source_id: SourceId,
    pub table: String,
    pub operation: Operation,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    pub sequence_token: SequenceToken,
    pub captured_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Row image identifying the changed entity: `before` for deletes, `after` otherwise,
    /// falling back to whichever image is present.
    pub fn key_image(&self) -> Option<&RowImage> {
        match self.operation {
            Operation::Delete => self.before.as_ref().or(self.after.as_ref()),
            Operation::Insert | Operation::Update => self.after.as_ref().or(self.before.as_ref()),
        }
    }

    pub fn to_envelope(&self) -> ChangeEventEnvelope {
        ChangeEventEnvelope {
            schema_version: CHANGE_EVENT_SCHEMA_VERSION,
            source_id: self.source_id.clone(),
            table: self.table.clone(),
            operation: self.operation,
            before: self.before.clone(),
            after: self.after.clone(),
            sequence_token: self.sequence_token,
            captured_at: self.captured_at,
        }
    }
}

/// Versioned, serializable form of a [`ChangeEvent`].
///
/// This is what transformers receive and what dead letters of the transform stage store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEventEnvelope {
    pub schema_version: u32,
    pub source_id: SourceId,
    pub table: String,
    pub operation: Operation,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    pub sequence_token: SequenceToken,
    pub captured_at: DateTime<Utc>,
}

impl TryFrom<ChangeEventEnvelope> for ChangeEvent {
    type Error = FlowError;

    fn try_from(envelope: ChangeEventEnvelope) -> FlowResult<Self> {
        if envelope.schema_version != CHANGE_EVENT_SCHEMA_VERSION {
            bail!(
                ErrorKind::UnsupportedSchemaVersion,
                "Unsupported change event schema version",
                format!(
                    "expected version {CHANGE_EVENT_SCHEMA_VERSION}, got {}",
                    envelope.schema_version
                )
            );
        }

        Ok(ChangeEvent {
            source_id: envelope.source_id,
            table: envelope.table,
            operation: envelope.operation,
            before: envelope.before,
            after: envelope.after,
            sequence_token: envelope.sequence_token,
            captured_at: envelope.captured_at,
        })
    }
}
