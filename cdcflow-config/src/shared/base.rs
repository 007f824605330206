use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A retry policy must allow at least one attempt.
    #[error("`{0}.max_attempts` cannot be zero")]
    RetryMaxAttemptsZero(&'static str),
    /// A retry policy must grow or keep its delay between attempts.
    #[error("`{0}.backoff_factor` must be at least 1.0")]
    RetryBackoffFactorTooSmall(&'static str),
    /// The initial retry delay is larger than the configured ceiling.
    #[error("`{0}.initial_delay_ms` cannot exceed `max_delay_ms`")]
    RetryDelayOutOfRange(&'static str),
    #[error("`circuit_breaker.failure_threshold` cannot be zero")]
    CircuitBreakerThresholdZero,
    #[error("`outbox_relay.batch_size` cannot be zero")]
    OutboxBatchSizeZero,
    #[error("`{0}` timeout cannot be zero")]
    TimeoutZero(&'static str),
    #[error("identifier `{0}` cannot be empty")]
    EmptyIdentifier(&'static str),
    #[error("workflow `{0}` declares no idempotency key fields")]
    MissingIdempotencyKeyFields(String),
    #[error("workflow `{workflow_id}` has an invalid table filter: {reason}")]
    InvalidTableFilter { workflow_id: String, reason: String },
    #[error("workflow `{workflow_id}` has an invalid delivery target: {reason}")]
    InvalidDeliveryTarget { workflow_id: String, reason: String },
    #[error("workflow `{0}` is defined more than once")]
    DuplicateWorkflow(String),
    #[error("source `{0}` has more than one pipeline")]
    DuplicatePipeline(String),
    #[error("workflow `{workflow_id}` references unknown transformer `{transformer_ref}`")]
    UnknownTransformer {
        workflow_id: String,
        transformer_ref: String,
    },
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
}
