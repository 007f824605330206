use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::types::{ChangeEventEnvelope, DeliveryTask, WorkflowId};

/// Identifier of a [`DeadLetterEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DeadLetterId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::str::FromStr for DeadLetterId {
    type Err = FlowError;

    fn from_str(value: &str) -> FlowResult<Self> {
        Ok(Self(Uuid::parse_str(value)?))
    }
}

impl fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Pipeline stage that gave up on an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterStage {
    #[serde(rename = "transform")]
    Transform,
    #[serde(rename = "delivery")]
    Delivery,
    #[serde(rename = "outbox-relay")]
    OutboxRelay,
}

impl DeadLetterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transform => "transform",
            Self::Delivery => "delivery",
            Self::OutboxRelay => "outbox-relay",
        }
    }
}

impl fmt::Display for DeadLetterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadLetterStage {
    type Err = FlowError;

    fn from_str(value: &str) -> FlowResult<Self> {
        Ok(match value {
            "transform" => Self::Transform,
            "delivery" => Self::Delivery,
            "outbox-relay" => Self::OutboxRelay,
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown dead letter stage",
                format!("stage `{other}`")
            ),
        })
    }
}

/// The item that failed: an event that could not be transformed, or a task that could not
/// be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeadLetterPayload {
    Event(ChangeEventEnvelope),
    Task(DeliveryTask),
}

/// A permanently failed item, kept until an operator replays it.
///
/// Entries are never deleted; replaying bumps `replay_count` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub workflow_id: WorkflowId,
    pub stage: DeadLetterStage,
    pub reason: String,
    pub attempts: u32,
    pub payload: DeadLetterPayload,
    pub created_at: DateTime<Utc>,
    pub replay_count: u32,
    pub last_replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn new(
        workflow_id: WorkflowId,
        stage: DeadLetterStage,
        reason: String,
        attempts: u32,
        payload: DeadLetterPayload,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            workflow_id,
            stage,
            reason,
            attempts,
            payload,
            created_at: Utc::now(),
            replay_count: 0,
            last_replayed_at: None,
        }
    }
}
