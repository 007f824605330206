use std::sync::Arc;

use cdcflow_config::shared::{OutboxRelayConfig, WorkflowDefinition};
use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::concurrency::backoff::Backoff;
use crate::concurrency::shutdown::ShutdownRx;
use crate::delivery::client::EndpointClient;
use crate::delivery::engine::{DeliveryEngine, DeliveryOutcome};
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::failpoints::{OUTBOX_RELAY_AFTER_SEND, flow_fail_point};
use crate::flow_error;
use crate::store::StateStore;
use crate::types::{DeadLetterStage, OutboxRecord, WorkflowHealth, WorkflowId};
use crate::workers::policy::build_error_handling_policy;

/// What a relay pass did with the records it polled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub polled: usize,
    pub delivered: usize,
    /// Failed and rescheduled.
    pub retried: usize,
    /// Not attempted because the endpoint circuit is open.
    pub deferred: usize,
    pub dead_lettered: usize,
    /// Already terminal when re-read.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayStep {
    Delivered,
    Retried,
    Deferred,
    DeadLettered,
    Skipped,
}

/// Delivers the outbox records of one exactly-once workflow.
///
/// Records are polled oldest first. A record that is already terminal when re-read is never
/// sent again. A crash between a successful send and marking the record delivered leads to
/// one more send of the same idempotency key, which the endpoint can discard.
#[derive(Debug)]
pub struct OutboxRelay<S, E> {
    workflow_id: WorkflowId,
    definition_rx: watch::Receiver<Arc<WorkflowDefinition>>,
    engine: DeliveryEngine<S, E>,
    store: S,
    config: OutboxRelayConfig,
}

impl<S, E> OutboxRelay<S, E>
where
    S: StateStore,
    E: EndpointClient + Clone + Send + Sync + 'static,
{
    pub fn new(
        definition_rx: watch::Receiver<Arc<WorkflowDefinition>>,
        engine: DeliveryEngine<S, E>,
        store: S,
        config: OutboxRelayConfig,
    ) -> Self {
        let workflow_id = definition_rx.borrow().workflow_id.clone();

        Self {
            workflow_id,
            definition_rx,
            engine,
            store,
            config,
        }
    }

    /// Polls due records once and attempts each of them.
    pub async fn run_once(&self) -> FlowResult<RelayReport> {
        let definition = self.definition_rx.borrow().clone();
        let records = self
            .store
            .poll_due_outbox_records(&self.workflow_id, Utc::now(), self.config.batch_size)
            .await?;

        let mut report = RelayReport {
            polled: records.len(),
            ..RelayReport::default()
        };
        for record in records {
            match self.relay_record(&definition, record).await? {
                RelayStep::Delivered => report.delivered += 1,
                RelayStep::Retried => report.retried += 1,
                RelayStep::Deferred => report.deferred += 1,
                RelayStep::DeadLettered => report.dead_lettered += 1,
                RelayStep::Skipped => report.skipped += 1,
            }
        }

        Ok(report)
    }

    /// Runs until shutdown or until the workflow is removed from the configuration.
    ///
    /// Store failures are retried on the next poll. Any other failure stops the relay; its
    /// records stay in the outbox and are picked up again after a restart.
    pub async fn run(self, mut shutdown_rx: ShutdownRx) -> FlowResult<()> {
        info!(workflow_id = %self.workflow_id, "starting outbox relay");

        loop {
            if shutdown_rx.is_shutdown() || self.definition_rx.has_changed().is_err() {
                break;
            }

            let batch_full = match self.run_once().await {
                Ok(report) => {
                    if report.polled > 0 {
                        debug!(workflow_id = %self.workflow_id, ?report, "relayed outbox records");
                    }
                    report.polled == self.config.batch_size && report.deferred == 0
                }
                Err(err) if build_error_handling_policy(&err).is_retryable() => {
                    warn!(workflow_id = %self.workflow_id, error = %err, "outbox relay pass failed");
                    false
                }
                Err(err) => {
                    error!(workflow_id = %self.workflow_id, error = %err, "outbox relay stopped");
                    self.engine.health().set(WorkflowHealth::Stopped {
                        reason: err.summary(),
                    });
                    return Err(err);
                }
            };

            if batch_full {
                continue;
            }

            if !shutdown_rx
                .sleep_unless_shutdown(self.config.poll_interval())
                .await
            {
                break;
            }
        }

        info!(workflow_id = %self.workflow_id, "outbox relay completed");

        Ok(())
    }

    async fn relay_record(
        &self,
        definition: &WorkflowDefinition,
        polled: OutboxRecord,
    ) -> FlowResult<RelayStep> {
        let Some(mut record) = self
            .store
            .get_outbox_record(&self.workflow_id, &polled.task.idempotency_key)
            .await?
        else {
            return Ok(RelayStep::Skipped);
        };
        if record.task.status.is_terminal() {
            return Ok(RelayStep::Skipped);
        }

        let err = match self.engine.deliver(definition, &mut record.task).await? {
            DeliveryOutcome::Delivered => {
                flow_fail_point(OUTBOX_RELAY_AFTER_SEND)?;

                record.last_error = None;
                self.store.update_outbox_record(&record).await?;
                self.engine.health().set(WorkflowHealth::Healthy);

                return Ok(RelayStep::Delivered);
            }
            DeliveryOutcome::CircuitOpen { .. } => {
                self.engine.health().set(WorkflowHealth::CircuitOpen);
                return Ok(RelayStep::Deferred);
            }
            DeliveryOutcome::TerminalFailure(err) => {
                return self.dead_letter(record, err).await;
            }
            DeliveryOutcome::RetryableFailure(err) => err,
        };

        let backoff = Backoff::new(definition.delivery.retry.clone());
        if !backoff.allows_retry(record.task.attempt_count) {
            return self.dead_letter(record, err).await;
        }

        let delay = backoff.delay_for(record.task.attempt_count);
        let delay = TimeDelta::from_std(delay).map_err(|err| {
            flow_error!(
                ErrorKind::ConversionError,
                "Retry delay is out of range",
                source: err
            )
        })?;
        record.next_attempt_at = Utc::now() + delay;
        record.last_error = Some(err.summary());
        self.store.update_outbox_record(&record).await?;

        self.engine.health().set(WorkflowHealth::Degraded {
            reason: err.summary(),
        });
        warn!(
            workflow_id = %self.workflow_id,
            idempotency_key = %record.task.idempotency_key,
            attempt = record.task.attempt_count,
            next_attempt_at = %record.next_attempt_at,
            error = %err.summary(),
            "relayed delivery failed, rescheduled"
        );

        Ok(RelayStep::Retried)
    }

    async fn dead_letter(&self, mut record: OutboxRecord, err: FlowError) -> FlowResult<RelayStep> {
        self.engine
            .dead_letter(&mut record.task, &err, DeadLetterStage::OutboxRelay)
            .await?;

        record.last_error = Some(err.summary());
        self.store.update_outbox_record(&record).await?;

        Ok(RelayStep::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cdcflow_config::shared::{
        CircuitBreakerConfig, DeliveryConfig, DeliveryGuarantee, DeliveryTargetConfig, RetryConfig,
        TableFilter,
    };
    use serde_json::json;

    use super::*;
    use crate::dead_letter::DeadLetterSink;
    use crate::delivery::circuit::CircuitBreaker;
    use crate::delivery::memory::{MemoryEndpoint, ScriptedResponse};
    use crate::metrics::WorkflowMetrics;
    use crate::store::OutboxStore;
    use crate::store::memory::MemoryStore;
    use crate::types::{
        ChangeEvent, DeliveryStatus, DeliveryTask, IdempotencyKey, Operation, SequenceToken,
        SourceId,
    };
    use crate::workers::health::HealthReporter;

    const URL: &str = "https://ledger.example.com";

    fn definition(max_attempts: u32) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: WorkflowId::new("ledger"),
            source_id: SourceId::new("shop-db"),
            table_filter: TableFilter::All,
            transformer_ref: "passthrough".to_string(),
            delivery_target: DeliveryTargetConfig {
                url: URL.to_string(),
                headers: Default::default(),
                timeout_ms: 500,
            },
            guarantee: DeliveryGuarantee::ExactlyOnce,
            idempotency_key_fields: vec!["id".to_string()],
            transform: Default::default(),
            delivery: DeliveryConfig {
                retry: RetryConfig {
                    max_attempts,
                    initial_delay_ms: 1,
                    max_delay_ms: 1,
                    backoff_factor: 1.0,
                },
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 10,
                    cool_down_ms: 1_000,
                },
            },
        }
    }

    fn task(token: u64) -> DeliveryTask {
        let event = ChangeEvent {
            source_id: SourceId::new("shop-db"),
            table: "payments".to_string(),
            operation: Operation::Insert,
            before: None,
            after: json!({ "id": token }).as_object().cloned(),
            sequence_token: SequenceToken::new(token),
            captured_at: Utc::now(),
        };
        let key = IdempotencyKey::derive(&event, &["id".to_string()]).unwrap();

        DeliveryTask::new(key, WorkflowId::new("ledger"), &event, json!({ "id": token }))
    }

    fn relay(
        endpoint: MemoryEndpoint,
        store: MemoryStore,
        definition: WorkflowDefinition,
    ) -> (
        OutboxRelay<MemoryStore, MemoryEndpoint>,
        watch::Sender<Arc<WorkflowDefinition>>,
    ) {
        let workflow_id = definition.workflow_id.clone();
        let engine = DeliveryEngine::new(
            endpoint,
            store.clone(),
            CircuitBreaker::new(
                workflow_id.clone(),
                definition.delivery.circuit_breaker.clone(),
            ),
            WorkflowMetrics::new(definition.source_id.clone(), workflow_id.clone()),
            HealthReporter::new(workflow_id),
        );
        let (definition_tx, definition_rx) = watch::channel(Arc::new(definition));

        (
            OutboxRelay::new(definition_rx, engine, store, OutboxRelayConfig::default()),
            definition_tx,
        )
    }

    async fn enqueue(store: &MemoryStore, task: DeliveryTask) {
        let checkpoint = crate::types::Checkpoint::workflow(
            task.source_id.clone(),
            task.workflow_id.clone(),
            task.sequence_token,
        );
        store
            .insert_outbox_record(OutboxRecord::new(task, checkpoint))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delivered_records_are_never_sent_again() {
        let store = MemoryStore::new();
        let endpoint = MemoryEndpoint::new();
        enqueue(&store, task(1)).await;
        enqueue(&store, task(2)).await;
        let (relay, _definition_tx) = relay(endpoint.clone(), store.clone(), definition(3));

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.delivered, 2);

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.polled, 0);
        assert_eq!(endpoint.calls_to(URL).await.len(), 2);

        let records = store
            .list_outbox_records(&WorkflowId::new("ledger"))
            .await
            .unwrap();
        assert!(
            records
                .iter()
                .all(|record| record.task.status == DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn failures_are_rescheduled_then_dead_lettered_on_exhaustion() {
        let store = MemoryStore::new();
        let endpoint = MemoryEndpoint::new();
        endpoint.respond_always(URL, ScriptedResponse::Status(500)).await;
        enqueue(&store, task(1)).await;
        let (relay, _definition_tx) = relay(endpoint.clone(), store.clone(), definition(2));

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.retried, 1);

        let record = store
            .get_outbox_record(&WorkflowId::new("ledger"), &task(1).idempotency_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.task.attempt_count, 1);
        assert!(record.last_error.is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let entries = DeadLetterSink::new(store.clone()).list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stage, DeadLetterStage::OutboxRelay);

        let record = store
            .get_outbox_record(&WorkflowId::new("ledger"), &task(1).idempotency_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.task.status, DeliveryStatus::DeadLettered);
    }

    #[tokio::test]
    async fn relay_stops_when_the_workflow_is_removed() {
        let store = MemoryStore::new();
        let (relay, definition_tx) = relay(MemoryEndpoint::new(), store, definition(3));
        let (_shutdown_tx, shutdown_rx) = crate::concurrency::shutdown::create_shutdown_channel();

        drop(definition_tx);

        relay.run(shutdown_rx).await.unwrap();
    }
}
