use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{CircuitBreakerConfig, RetryConfig, ValidationError};

/// Identifier of a change source, e.g. a database.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a workflow, unique across the whole deployment.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Delivery guarantee of a workflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Delivered directly; a crash between send and checkpoint causes a redelivery with
    /// the same idempotency key.
    #[default]
    AtLeastOnce,
    /// Written to the transactional outbox together with the workflow checkpoint and sent
    /// by the relay.
    ExactlyOnce,
}

impl fmt::Display for DeliveryGuarantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtLeastOnce => f.write_str("at_least_once"),
            Self::ExactlyOnce => f.write_str("exactly_once"),
        }
    }
}

/// Selects which tables of a source a workflow subscribes to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableFilter {
    All,
    Tables { names: Vec<String> },
    /// Every table whose name starts with `prefix`.
    Prefix { prefix: String },
}

impl TableFilter {
    pub fn matches(&self, table: &str) -> bool {
        match self {
            Self::All => true,
            Self::Tables { names } => names.iter().any(|name| name == table),
            Self::Prefix { prefix } => table.starts_with(prefix.as_str()),
        }
    }

    fn validate(&self, workflow_id: &WorkflowId) -> Result<(), ValidationError> {
        let reason = match self {
            Self::All => return Ok(()),
            Self::Tables { names } if names.is_empty() => "table list is empty",
            Self::Tables { names } if names.iter().any(|name| name.is_empty()) => {
                "table names cannot be empty"
            }
            Self::Prefix { prefix } if prefix.is_empty() => "prefix is empty, use `all` instead",
            _ => return Ok(()),
        };

        Err(ValidationError::InvalidTableFilter {
            workflow_id: workflow_id.to_string(),
            reason: reason.to_string(),
        })
    }
}

const fn default_delivery_timeout_ms() -> u64 {
    30_000
}

const fn default_transform_timeout_ms() -> u64 {
    5_000
}

/// The external HTTP endpoint a workflow delivers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTargetConfig {
    pub url: String,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_delivery_timeout_ms")]
    pub timeout_ms: u64,
}

impl DeliveryTargetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self, workflow_id: &WorkflowId) -> Result<(), ValidationError> {
        let reason = if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            Some(format!("`{}` is not an http(s) url", self.url))
        } else if self.timeout_ms == 0 {
            Some("timeout_ms cannot be zero".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ValidationError::InvalidDeliveryTarget {
                workflow_id: workflow_id.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Transformation stage settings of a workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Deadline for a single transformer invocation.
    #[serde(default = "default_transform_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl TransformConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_transform_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

/// Delivery stage settings of a workflow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// A workflow: which changes to pick up, how to transform them and where to deliver them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: WorkflowId,
    pub source_id: SourceId,
    pub table_filter: TableFilter,
    /// Name of a transformer registered with the pipeline.
    pub transformer_ref: String,
    pub delivery_target: DeliveryTargetConfig,
    #[serde(default)]
    pub guarantee: DeliveryGuarantee,
    /// Row fields identifying an entity, in order. They make up the business key part of
    /// the idempotency key.
    pub idempotency_key_fields: Vec<String>,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl WorkflowDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workflow_id.as_str().is_empty() {
            return Err(ValidationError::EmptyIdentifier("workflow_id"));
        }

        if self.source_id.as_str().is_empty() {
            return Err(ValidationError::EmptyIdentifier("source_id"));
        }

        if self.transformer_ref.is_empty() {
            return Err(ValidationError::EmptyIdentifier("transformer_ref"));
        }

        if self.idempotency_key_fields.is_empty()
            || self.idempotency_key_fields.iter().any(|f| f.is_empty())
        {
            return Err(ValidationError::MissingIdempotencyKeyFields(
                self.workflow_id.to_string(),
            ));
        }

        if self.transform.timeout_ms == 0 {
            return Err(ValidationError::TimeoutZero("transform.timeout_ms"));
        }

        self.table_filter.validate(&self.workflow_id)?;
        self.delivery_target.validate(&self.workflow_id)?;
        self.transform.retry.validate("transform.retry")?;
        self.delivery.retry.validate("delivery.retry")?;
        self.delivery.circuit_breaker.validate()?;

        Ok(())
    }

    pub fn is_exactly_once(&self) -> bool {
        self.guarantee == DeliveryGuarantee::ExactlyOnce
    }
}
