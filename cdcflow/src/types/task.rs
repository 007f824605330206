use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, FlowResult};
use crate::types::{ChangeEvent, Checkpoint, SequenceToken, SourceId, WorkflowId};

/// Deterministic identity of a delivery.
///
/// Rendered as `{source}:{table}:{field=value,...}:{sequence token}`. The same change
/// always yields the same key, so an endpoint can discard redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the key of `event` from the workflow's key fields.
    ///
    /// Fails with [`ErrorKind::IdempotencyKeyUnavailable`] when a field is missing or null
    /// in the row image identifying the entity.
    pub fn derive(event: &ChangeEvent, key_fields: &[String]) -> FlowResult<Self> {
        let Some(image) = event.key_image() else {
            bail!(
                ErrorKind::IdempotencyKeyUnavailable,
                "Change event has no row image",
                format!("event {} on `{}`", event.sequence_token, event.table)
            );
        };

        let mut business_key = Vec::with_capacity(key_fields.len());
        for field in key_fields {
            let value = match image.get(field) {
                Some(serde_json::Value::Null) | None => bail!(
                    ErrorKind::IdempotencyKeyUnavailable,
                    "Idempotency key field is missing",
                    format!(
                        "field `{field}` is absent or null in event {} on `{}`",
                        event.sequence_token, event.table
                    )
                ),
                Some(serde_json::Value::String(value)) => value.clone(),
                Some(value) => value.to_string(),
            };
            business_key.push(format!("{field}={value}"));
        }

        Ok(Self(format!(
            "{}:{}:{}:{}",
            event.source_id,
            event.table,
            business_key.join(","),
            event.sequence_token
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdempotencyKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a [`DeliveryTask`].
///
/// `Pending -> InFlight -> Delivered | Retrying | DeadLettered`, with `Retrying -> InFlight`
/// for the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Retrying,
    Delivered,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLettered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = crate::error::FlowError;

    fn from_str(value: &str) -> FlowResult<Self> {
        Ok(match value {
            "pending" => Self::Pending,
            "in_flight" => Self::InFlight,
            "retrying" => Self::Retrying,
            "delivered" => Self::Delivered,
            "dead_lettered" => Self::DeadLettered,
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown delivery status",
                format!("status `{other}`")
            ),
        })
    }
}

/// A transformed payload waiting to be delivered to a workflow's endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub idempotency_key: IdempotencyKey,
    pub workflow_id: WorkflowId,
    pub source_id: SourceId,
    pub sequence_token: SequenceToken,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

impl DeliveryTask {
    pub fn new(
        idempotency_key: IdempotencyKey,
        workflow_id: WorkflowId,
        event: &ChangeEvent,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            idempotency_key,
            workflow_id,
            source_id: event.source_id.clone(),
            sequence_token: event.sequence_token,
            payload,
            attempt_count: 0,
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Moves to [`DeliveryStatus::InFlight`] and counts the attempt.
    pub fn begin_attempt(&mut self) -> FlowResult<()> {
        self.transition(
            &[DeliveryStatus::Pending, DeliveryStatus::Retrying],
            DeliveryStatus::InFlight,
        )?;
        self.attempt_count += 1;
        Ok(())
    }

    pub fn mark_delivered(&mut self) -> FlowResult<()> {
        self.transition(&[DeliveryStatus::InFlight], DeliveryStatus::Delivered)
    }

    pub fn mark_retrying(&mut self) -> FlowResult<()> {
        self.transition(&[DeliveryStatus::InFlight], DeliveryStatus::Retrying)
    }

    pub fn mark_dead_lettered(&mut self) -> FlowResult<()> {
        self.transition(
            &[
                DeliveryStatus::Pending,
                DeliveryStatus::InFlight,
                DeliveryStatus::Retrying,
            ],
            DeliveryStatus::DeadLettered,
        )
    }

    /// Resets a dead lettered task so it can be delivered again from scratch.
    pub fn reset_for_replay(&mut self) {
        self.status = DeliveryStatus::Pending;
        self.attempt_count = 0;
    }

    fn transition(&mut self, from: &[DeliveryStatus], to: DeliveryStatus) -> FlowResult<()> {
        if !from.contains(&self.status) {
            bail!(
                ErrorKind::InvalidState,
                "Invalid delivery task transition",
                format!(
                    "task {} cannot move from {} to {to}",
                    self.idempotency_key, self.status
                )
            );
        }

        self.status = to;
        Ok(())
    }
}

/// A delivery task persisted in the transactional outbox of an exactly-once workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub task: DeliveryTask,
    /// Workflow checkpoint committed in the same transaction as the record.
    pub written_in_transaction_with: Checkpoint,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn new(task: DeliveryTask, checkpoint: Checkpoint) -> Self {
        Self {
            next_attempt_at: task.created_at,
            task,
            written_in_transaction_with: checkpoint,
            last_error: None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.task.created_at
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.task.status.is_terminal() && self.next_attempt_at <= now
    }
}
