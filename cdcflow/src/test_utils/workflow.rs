use std::collections::BTreeMap;

use cdcflow_config::shared::{
    CircuitBreakerConfig, DeliveryConfig, DeliveryGuarantee, DeliveryTargetConfig, RetryConfig,
    TableFilter, TransformConfig, WorkflowDefinition,
};

use crate::transform::PASSTHROUGH_TRANSFORMER;
use crate::types::{SourceId, WorkflowId};

/// Source id used by test workflows unless overridden.
pub const TEST_SOURCE_ID: &str = "shop-db";

/// Retry policy with millisecond delays, so retries exhaust quickly.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        backoff_factor: 2.0,
    }
}

/// Builder for [`WorkflowDefinition`]s used in tests.
///
/// Defaults: source [`TEST_SOURCE_ID`], every table, the passthrough transformer, key field
/// `id`, at-least-once, three fast attempts per stage and a circuit breaker opening after
/// five failures for thirty seconds.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    definition: WorkflowDefinition,
}

impl WorkflowBuilder {
    pub fn new(workflow_id: &str, url: &str) -> Self {
        Self {
            definition: WorkflowDefinition {
                workflow_id: WorkflowId::new(workflow_id),
                source_id: SourceId::new(TEST_SOURCE_ID),
                table_filter: TableFilter::All,
                transformer_ref: PASSTHROUGH_TRANSFORMER.to_string(),
                delivery_target: DeliveryTargetConfig {
                    url: url.to_string(),
                    headers: BTreeMap::new(),
                    timeout_ms: 1_000,
                },
                guarantee: DeliveryGuarantee::AtLeastOnce,
                idempotency_key_fields: vec!["id".to_string()],
                transform: TransformConfig {
                    timeout_ms: 1_000,
                    retry: fast_retry(3),
                },
                delivery: DeliveryConfig {
                    retry: fast_retry(3),
                    circuit_breaker: CircuitBreakerConfig {
                        failure_threshold: 5,
                        cool_down_ms: 30_000,
                    },
                },
            },
        }
    }

    pub fn source(mut self, source_id: &str) -> Self {
        self.definition.source_id = SourceId::new(source_id);
        self
    }

    pub fn tables(mut self, tables: &[&str]) -> Self {
        self.definition.table_filter = TableFilter::Tables {
            names: tables.iter().map(|table| table.to_string()).collect(),
        };
        self
    }

    pub fn transformer(mut self, transformer_ref: &str) -> Self {
        self.definition.transformer_ref = transformer_ref.to_string();
        self
    }

    pub fn key_fields(mut self, fields: &[&str]) -> Self {
        self.definition.idempotency_key_fields =
            fields.iter().map(|field| field.to_string()).collect();
        self
    }

    pub fn exactly_once(mut self) -> Self {
        self.definition.guarantee = DeliveryGuarantee::ExactlyOnce;
        self
    }

    pub fn transform_retry(mut self, retry: RetryConfig) -> Self {
        self.definition.transform.retry = retry;
        self
    }

    pub fn transform_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.definition.transform.timeout_ms = timeout_ms;
        self
    }

    pub fn delivery_retry(mut self, retry: RetryConfig) -> Self {
        self.definition.delivery.retry = retry;
        self
    }

    pub fn delivery_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.definition.delivery_target.timeout_ms = timeout_ms;
        self
    }

    pub fn circuit_breaker(mut self, failure_threshold: u32, cool_down_ms: u64) -> Self {
        self.definition.delivery.circuit_breaker = CircuitBreakerConfig {
            failure_threshold,
            cool_down_ms,
        };
        self
    }

    pub fn build(self) -> WorkflowDefinition {
        self.definition
    }
}
