use crate::error::{ErrorKind, FlowError};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// Retried automatically following the stage's backoff policy.
    Timed,
    /// Not retried automatically; the item is dead lettered for an operator to replay.
    Manual,
    /// Not retried at all; the failing worker stops.
    NoRetry,
}

/// How an error is handled by the stage that observed it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_directive == RetryDirective::Timed
    }

    /// Operator facing hint, stored with dead letters.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Classifies a [`FlowError`] so capture, transformation, delivery and the relay agree on
/// which failures are transient.
pub fn build_error_handling_policy(error: &FlowError) -> ErrorHandlingPolicy {
    match error.kind() {
        // Transient failures of the source, the state store, the transformer or the endpoint.
        ErrorKind::SourceConnectionFailed
        | ErrorKind::SourceQueryFailed
        | ErrorKind::StateStoreConnectionFailed
        | ErrorKind::StateStoreQueryFailed
        | ErrorKind::TransformFailed
        | ErrorKind::TransformTimedOut
        | ErrorKind::TransformPanicked
        | ErrorKind::EndpointUnavailable
        | ErrorKind::EndpointRetryableStatus
        | ErrorKind::DeliveryTimedOut
        | ErrorKind::IoError => ErrorHandlingPolicy::new(RetryDirective::Timed, None),

        ErrorKind::TransformerNotFound => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Register the transformer referenced by the workflow, then replay the entry."),
        ),
        ErrorKind::IdempotencyKeyUnavailable => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some(
                "Make sure every idempotency key field of the workflow exists in the row, then replay the entry.",
            ),
        ),
        ErrorKind::EndpointRejected => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Inspect why the endpoint rejected the payload, fix the transformer or the endpoint and replay the entry."),
        ),
        ErrorKind::UnsupportedSchemaVersion => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Upgrade the consumer to a version supporting this change event schema."),
        ),

        ErrorKind::SourceFatal
        | ErrorKind::SourceSequenceRegression
        | ErrorKind::InvalidState
        | ErrorKind::CaptureWorkerPanic
        | ErrorKind::WorkflowWorkerPanic
        | ErrorKind::RelayWorkerPanic => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Check the logs for the failing component and restart the pipeline."),
        ),

        #[cfg(feature = "failpoints")]
        ErrorKind::WithNoRetry => {
            ErrorHandlingPolicy::new(RetryDirective::NoRetry, Some("Cannot retry this error."))
        }
        #[cfg(feature = "failpoints")]
        ErrorKind::WithManualRetry => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Manually trigger retry after resolving the issue."),
        ),
        #[cfg(feature = "failpoints")]
        ErrorKind::WithTimedRetry => ErrorHandlingPolicy::new(
            RetryDirective::Timed,
            Some("Will automatically retry after the configured delay."),
        ),

        _ => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("There is no single prescribed solution for this error, inspect the detail and replay the entry once fixed."),
        ),
    }
}
