use std::sync::Arc;
use std::time::Duration;

use cdcflow_config::shared::WorkflowDefinition;
use tracing::{debug, warn};

use crate::concurrency::backoff::Backoff;
use crate::concurrency::shutdown::ShutdownRx;
use crate::dead_letter::DeadLetterSink;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::metrics::WorkflowMetrics;
use crate::store::DeadLetterStore;
use crate::transform::TransformerRegistry;
use crate::types::{
    ChangeEvent, DeadLetterId, DeadLetterPayload, DeadLetterStage, DeliveryTask, IdempotencyKey,
};
use crate::workers::policy::build_error_handling_policy;

/// Result of a single transformer invocation.
#[derive(Debug)]
pub enum TransformResult {
    Success(serde_json::Value),
    Failure(FlowError),
}

/// Final result of transforming a change for a workflow.
#[derive(Debug)]
pub enum TransformOutcome {
    /// The change was transformed into a task ready for delivery.
    Task(DeliveryTask),
    /// Every attempt failed and the change was dead lettered.
    DeadLettered(DeadLetterId),
    /// Shutdown was requested while waiting for a retry.
    Interrupted,
}

/// Invokes transformers with a deadline, contains their failures and applies the
/// workflow's transform retry policy.
#[derive(Debug, Clone)]
pub struct TransformationExecutor<S> {
    registry: TransformerRegistry,
    dead_letters: DeadLetterSink<S>,
    metrics: Arc<WorkflowMetrics>,
}

impl<S> TransformationExecutor<S>
where
    S: DeadLetterStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        registry: TransformerRegistry,
        dead_letters: DeadLetterSink<S>,
        metrics: Arc<WorkflowMetrics>,
    ) -> Self {
        Self {
            registry,
            dead_letters,
            metrics,
        }
    }

    /// Runs the transformer named `transformer_ref` once on its own task.
    ///
    /// Errors, panics and deadline overruns of the transformer become
    /// [`TransformResult::Failure`]; they never propagate to the caller.
    pub async fn execute(
        &self,
        transformer_ref: &str,
        event: &ChangeEvent,
        timeout: Duration,
    ) -> TransformResult {
        let transformer = match self.registry.get(transformer_ref) {
            Ok(transformer) => transformer,
            Err(err) => return TransformResult::Failure(err),
        };

        let envelope = event.to_envelope();
        let mut handle = tokio::spawn(async move { transformer.transform(&envelope).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(payload))) => TransformResult::Success(payload),
            Ok(Ok(Err(err))) => TransformResult::Failure(err),
            Ok(Err(join_err)) => TransformResult::Failure(flow_error!(
                ErrorKind::TransformPanicked,
                "Transformer panicked",
                format!("transformer `{transformer_ref}`: {join_err}")
            )),
            Err(_) => {
                handle.abort();

                TransformResult::Failure(flow_error!(
                    ErrorKind::TransformTimedOut,
                    "Transformer exceeded its deadline",
                    format!(
                        "transformer `{transformer_ref}` did not finish within {}ms",
                        timeout.as_millis()
                    )
                ))
            }
        }
    }

    /// Transforms `event` for `definition`, retrying per the workflow's transform policy.
    ///
    /// The idempotency key is derived from the source coordinates before the transformer
    /// runs, so every attempt and every redelivery of the change carries the same key. An
    /// event whose key cannot be derived is dead lettered right away.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        event: &ChangeEvent,
        shutdown_rx: &mut ShutdownRx,
    ) -> FlowResult<TransformOutcome> {
        let workflow_id = &definition.workflow_id;

        let key = match IdempotencyKey::derive(event, &definition.idempotency_key_fields) {
            Ok(key) => key,
            Err(err) => return self.dead_letter(definition, event, err, 0).await,
        };

        let backoff = Backoff::new(definition.transform.retry.clone());
        let mut attempts = 0;
        loop {
            attempts += 1;

            let err = match self
                .execute(
                    &definition.transformer_ref,
                    event,
                    definition.transform.timeout(),
                )
                .await
            {
                TransformResult::Success(payload) => {
                    debug!(%workflow_id, idempotency_key = %key, attempts, "transformed change");

                    return Ok(TransformOutcome::Task(DeliveryTask::new(
                        key,
                        workflow_id.clone(),
                        event,
                        payload,
                    )));
                }
                TransformResult::Failure(err) => err,
            };

            self.metrics.record_transform_failure();

            let policy = build_error_handling_policy(&err);
            if !policy.is_retryable() || !backoff.allows_retry(attempts) {
                return self.dead_letter(definition, event, err, attempts).await;
            }

            let delay = backoff.delay_for(attempts);
            warn!(
                %workflow_id,
                idempotency_key = %key,
                attempt = attempts,
                max_attempts = backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err.summary(),
                "transformation failed, retrying"
            );

            if !shutdown_rx.sleep_unless_shutdown(delay).await {
                return Ok(TransformOutcome::Interrupted);
            }
        }
    }

    async fn dead_letter(
        &self,
        definition: &WorkflowDefinition,
        event: &ChangeEvent,
        err: FlowError,
        attempts: u32,
    ) -> FlowResult<TransformOutcome> {
        let reason = match build_error_handling_policy(&err).solution() {
            Some(solution) => format!("{} ({solution})", err.summary()),
            None => err.summary(),
        };

        let entry = self
            .dead_letters
            .record(
                &definition.workflow_id,
                DeadLetterStage::Transform,
                reason,
                attempts,
                DeadLetterPayload::Event(event.to_envelope()),
            )
            .await?;
        self.metrics.record_dead_letter(DeadLetterStage::Transform);

        Ok(TransformOutcome::DeadLettered(entry.id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use cdcflow_config::shared::{DeliveryTargetConfig, RetryConfig, TableFilter, TransformConfig};
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::bail;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::store::memory::MemoryStore;
    use crate::transform::{FnTransformer, Transformer};
    use crate::types::{ChangeEventEnvelope, Operation, SequenceToken, SourceId, WorkflowId};

    #[derive(Debug)]
    struct SlowTransformer;

    #[async_trait::async_trait]
    impl Transformer for SlowTransformer {
        async fn transform(&self, _event: &ChangeEventEnvelope) -> FlowResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    fn definition(transformer_ref: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: WorkflowId::new("b"),
            source_id: SourceId::new("shop-db"),
            table_filter: TableFilter::All,
            transformer_ref: transformer_ref.to_string(),
            delivery_target: DeliveryTargetConfig {
                url: "https://b.example.com".to_string(),
                headers: Default::default(),
                timeout_ms: 1_000,
            },
            guarantee: Default::default(),
            idempotency_key_fields: vec!["order_id".to_string()],
            transform: TransformConfig {
                timeout_ms: 100,
                retry: RetryConfig {
                    max_attempts: 3,
                    initial_delay_ms: 10,
                    max_delay_ms: 50,
                    backoff_factor: 2.0,
                },
            },
            delivery: Default::default(),
        }
    }

    fn event(after: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            source_id: SourceId::new("shop-db"),
            table: "orders".to_string(),
            operation: Operation::Insert,
            before: None,
            after: after.as_object().cloned(),
            sequence_token: SequenceToken::new(55),
            captured_at: Utc::now(),
        }
    }

    fn executor(
        registry: TransformerRegistry,
        store: MemoryStore,
    ) -> TransformationExecutor<MemoryStore> {
        TransformationExecutor::new(
            registry,
            DeadLetterSink::new(store),
            WorkflowMetrics::new(SourceId::new("shop-db"), WorkflowId::new("b")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_overruns_become_failures() {
        let mut registry = TransformerRegistry::new();
        registry.register("slow", Arc::new(SlowTransformer));
        let executor = executor(registry, MemoryStore::new());

        let result = executor
            .execute("slow", &event(json!({ "order_id": 1 })), Duration::from_millis(100))
            .await;

        let TransformResult::Failure(err) = result else {
            panic!("expected a failure");
        };
        assert_eq!(err.kind(), ErrorKind::TransformTimedOut);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let mut registry = TransformerRegistry::new();
        registry.register(
            "panicky",
            Arc::new(FnTransformer::new("panicky", |_| panic!("bad transformer"))),
        );
        let executor = executor(registry, MemoryStore::new());

        let result = executor
            .execute("panicky", &event(json!({ "order_id": 1 })), Duration::from_secs(1))
            .await;

        let TransformResult::Failure(err) = result else {
            panic!("expected a failure");
        };
        assert_eq!(err.kind(), ErrorKind::TransformPanicked);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter_the_event() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = TransformerRegistry::new();
        registry.register(
            "failing",
            Arc::new(FnTransformer::new("failing", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                bail!(ErrorKind::TransformFailed, "Business rule violated")
            })),
        );
        let store = MemoryStore::new();
        let executor = executor(registry, store.clone());
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();

        let outcome = executor
            .run(
                &definition("failing"),
                &event(json!({ "order_id": 55 })),
                &mut shutdown_rx,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, TransformOutcome::DeadLettered(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let entries = DeadLetterSink::new(store).list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stage, DeadLetterStage::Transform);
        assert_eq!(entries[0].attempts, 3);
    }

    #[tokio::test]
    async fn successful_transforms_carry_the_derived_key() {
        let executor = executor(TransformerRegistry::with_builtins(), MemoryStore::new());
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();

        let outcome = executor
            .run(
                &definition("passthrough"),
                &event(json!({ "order_id": 42 })),
                &mut shutdown_rx,
            )
            .await
            .unwrap();

        let TransformOutcome::Task(task) = outcome else {
            panic!("expected a task");
        };
        assert_eq!(task.idempotency_key.as_str(), "shop-db:orders:order_id=42:55");
        assert_eq!(task.payload["schema_version"], 1);
    }

    #[tokio::test]
    async fn missing_key_fields_are_dead_lettered_without_invoking_the_transformer() {
        let store = MemoryStore::new();
        let executor = executor(TransformerRegistry::with_builtins(), store.clone());
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();

        let outcome = executor
            .run(
                &definition("passthrough"),
                &event(json!({ "other": 1 })),
                &mut shutdown_rx,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, TransformOutcome::DeadLettered(_)));
        let entries = DeadLetterSink::new(store).list(None).await.unwrap();
        assert_eq!(entries[0].attempts, 0);
        assert!(entries[0].reason.contains("IdempotencyKeyUnavailable"));
    }
}
