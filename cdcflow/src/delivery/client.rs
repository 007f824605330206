use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use cdcflow_config::shared::WorkflowDefinition;

use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::types::{DeliveryTask, IdempotencyKey};

/// Header carrying the idempotency key of every delivery.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// A single call to a workflow endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRequest {
    pub url: String,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub idempotency_key: IdempotencyKey,
    pub timeout: Duration,
}

impl EndpointRequest {
    pub fn new(definition: &WorkflowDefinition, task: &DeliveryTask) -> Self {
        Self {
            url: definition.delivery_target.url.clone(),
            payload: task.payload.clone(),
            headers: definition.delivery_target.headers.clone(),
            idempotency_key: task.idempotency_key.clone(),
            timeout: definition.delivery_target.timeout(),
        }
    }
}

/// Status code returned by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointStatus(pub u16);

impl EndpointStatus {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// Statuses worth retrying: request timeouts, throttling and server errors.
    pub fn is_retryable(&self) -> bool {
        matches!(self.0, 408 | 425 | 429) || (500..600).contains(&self.0)
    }

    /// Converts a non successful status into the matching error.
    pub fn into_error(self, url: &str) -> Option<FlowError> {
        if self.is_success() {
            return None;
        }

        let detail = format!("endpoint {url} answered {self}");
        Some(if self.is_retryable() {
            flow_error!(
                ErrorKind::EndpointRetryableStatus,
                "Endpoint answered with a retryable status",
                detail
            )
        } else {
            flow_error!(
                ErrorKind::EndpointRejected,
                "Endpoint rejected the delivery",
                detail
            )
        })
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sends payloads to workflow endpoints.
///
/// Implementations return the endpoint's status for any answer and an error only when no
/// answer was received.
pub trait EndpointClient {
    fn send(
        &self,
        request: &EndpointRequest,
    ) -> impl Future<Output = FlowResult<EndpointStatus>> + Send;
}
