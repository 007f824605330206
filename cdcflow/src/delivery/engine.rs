use std::sync::Arc;
use std::time::Duration;

use cdcflow_config::shared::WorkflowDefinition;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::concurrency::backoff::Backoff;
use crate::concurrency::shutdown::ShutdownRx;
use crate::dead_letter::DeadLetterSink;
use crate::delivery::circuit::{CircuitBreaker, CircuitDecision};
use crate::delivery::client::{EndpointClient, EndpointRequest};
use crate::error::{FlowError, FlowResult};
use crate::metrics::{AttemptOutcome, WorkflowMetrics};
use crate::store::StateStore;
use crate::types::{
    Checkpoint, DeadLetterId, DeadLetterPayload, DeadLetterStage, DeliveryTask, OutboxRecord,
    SequenceToken, WorkflowHealth,
};
use crate::workers::health::HealthReporter;
use crate::workers::policy::build_error_handling_policy;

/// Result of a single delivery attempt.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered,
    /// The circuit is open and no attempt was made.
    CircuitOpen { retry_in: Duration },
    RetryableFailure(FlowError),
    TerminalFailure(FlowError),
}

/// How a delivery task was finally resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResolution {
    Delivered,
    DeadLettered(DeadLetterId),
    /// Shutdown was requested before the task was resolved.
    Interrupted,
}

/// Delivers a workflow's tasks to its endpoint.
///
/// Owns the endpoint circuit breaker of the workflow and its delivery retry policy. Tasks that
/// exhaust their attempts or are rejected by the endpoint are dead lettered.
#[derive(Debug, Clone)]
pub struct DeliveryEngine<S, E> {
    client: E,
    store: S,
    dead_letters: DeadLetterSink<S>,
    breaker: CircuitBreaker,
    metrics: Arc<WorkflowMetrics>,
    health: HealthReporter,
}

impl<S, E> DeliveryEngine<S, E>
where
    S: StateStore,
    E: EndpointClient + Clone + Send + Sync + 'static,
{
    pub fn new(
        client: E,
        store: S,
        breaker: CircuitBreaker,
        metrics: Arc<WorkflowMetrics>,
        health: HealthReporter,
    ) -> Self {
        Self {
            client,
            dead_letters: DeadLetterSink::new(store.clone()),
            store,
            breaker,
            metrics,
            health,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Makes one attempt to deliver `task`, unless the circuit is open.
    ///
    /// The task moves to `InFlight` and then to `Delivered` or `Retrying`. A terminal failure
    /// leaves it `InFlight` for the caller to dead letter.
    pub async fn deliver(
        &self,
        definition: &WorkflowDefinition,
        task: &mut DeliveryTask,
    ) -> FlowResult<DeliveryOutcome> {
        if let CircuitDecision::Rejected { retry_in } = self.breaker.check().await {
            return Ok(DeliveryOutcome::CircuitOpen { retry_in });
        }

        task.begin_attempt()?;
        let request = EndpointRequest::new(definition, task);

        let started = Instant::now();
        let result = match tokio::time::timeout(request.timeout, self.client.send(&request)).await
        {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };
        let latency = started.elapsed();

        let (outcome, attempt_outcome) = match result {
            Ok(status) => match status.into_error(&request.url) {
                None => (DeliveryOutcome::Delivered, AttemptOutcome::Delivered),
                Some(err) if status.is_retryable() => (
                    DeliveryOutcome::RetryableFailure(err),
                    AttemptOutcome::Retryable,
                ),
                Some(err) => (
                    DeliveryOutcome::TerminalFailure(err),
                    AttemptOutcome::Terminal,
                ),
            },
            Err(err) if build_error_handling_policy(&err).is_retryable() => (
                DeliveryOutcome::RetryableFailure(err),
                AttemptOutcome::Retryable,
            ),
            Err(err) => (
                DeliveryOutcome::TerminalFailure(err),
                AttemptOutcome::Terminal,
            ),
        };

        match attempt_outcome {
            AttemptOutcome::Delivered => {
                self.breaker.record_success().await;
                task.mark_delivered()?;
            }
            AttemptOutcome::Retryable => {
                self.breaker.record_failure().await;
                task.mark_retrying()?;
            }
            // The endpoint answered, so it is reachable.
            AttemptOutcome::Terminal => self.breaker.record_success().await,
        }
        self.metrics.record_delivery_attempt(latency, attempt_outcome);

        debug!(
            workflow_id = %definition.workflow_id,
            idempotency_key = %task.idempotency_key,
            attempt = task.attempt_count,
            latency_ms = latency.as_millis() as u64,
            status = %task.status,
            "delivery attempt finished"
        );

        Ok(outcome)
    }

    /// Delivers `task` at least once, retrying with backoff until it is delivered, its
    /// attempts are exhausted or the endpoint rejects it.
    ///
    /// Time spent waiting for an open circuit does not count as an attempt.
    pub async fn deliver_with_retries(
        &self,
        definition: &WorkflowDefinition,
        mut task: DeliveryTask,
        shutdown_rx: &mut ShutdownRx,
    ) -> FlowResult<DeliveryResolution> {
        let backoff = Backoff::new(definition.delivery.retry.clone());

        loop {
            let err = match self.deliver(definition, &mut task).await? {
                DeliveryOutcome::Delivered => {
                    self.health.set(WorkflowHealth::Healthy);
                    return Ok(DeliveryResolution::Delivered);
                }
                DeliveryOutcome::CircuitOpen { retry_in } => {
                    self.health.set(WorkflowHealth::CircuitOpen);
                    if !shutdown_rx.sleep_unless_shutdown(retry_in).await {
                        return Ok(DeliveryResolution::Interrupted);
                    }
                    continue;
                }
                DeliveryOutcome::TerminalFailure(err) => {
                    let id = self
                        .dead_letter(&mut task, &err, DeadLetterStage::Delivery)
                        .await?;
                    return Ok(DeliveryResolution::DeadLettered(id));
                }
                DeliveryOutcome::RetryableFailure(err) => err,
            };

            if !backoff.allows_retry(task.attempt_count) {
                let id = self
                    .dead_letter(&mut task, &err, DeadLetterStage::Delivery)
                    .await?;
                return Ok(DeliveryResolution::DeadLettered(id));
            }

            self.health.set(WorkflowHealth::Degraded {
                reason: err.summary(),
            });

            let delay = backoff.delay_for(task.attempt_count);
            warn!(
                workflow_id = %definition.workflow_id,
                idempotency_key = %task.idempotency_key,
                attempt = task.attempt_count,
                max_attempts = backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err.summary(),
                "delivery failed, retrying"
            );

            if !shutdown_rx.sleep_unless_shutdown(delay).await {
                return Ok(DeliveryResolution::Interrupted);
            }
        }
    }

    /// Durably enqueues `task` in the outbox together with the workflow checkpoint at `token`.
    ///
    /// Returns `false` when a record with the same idempotency key already existed.
    pub async fn enqueue_exactly_once(
        &self,
        task: DeliveryTask,
        token: SequenceToken,
    ) -> FlowResult<bool> {
        let checkpoint =
            Checkpoint::workflow(task.source_id.clone(), task.workflow_id.clone(), token);
        let idempotency_key = task.idempotency_key.clone();
        let workflow_id = task.workflow_id.clone();

        let inserted = self
            .store
            .insert_outbox_record(OutboxRecord::new(task, checkpoint))
            .await?;

        debug!(
            %workflow_id,
            %idempotency_key,
            sequence_token = %token,
            inserted,
            "enqueued task in outbox"
        );

        Ok(inserted)
    }

    /// Moves `task` to the dead letter sink, tagged with `stage`.
    pub async fn dead_letter(
        &self,
        task: &mut DeliveryTask,
        err: &FlowError,
        stage: DeadLetterStage,
    ) -> FlowResult<DeadLetterId> {
        task.mark_dead_lettered()?;

        let reason = match build_error_handling_policy(err).solution() {
            Some(solution) => format!("{} ({solution})", err.summary()),
            None => err.summary(),
        };
        let entry = self
            .dead_letters
            .record(
                &task.workflow_id,
                stage,
                reason,
                task.attempt_count,
                DeadLetterPayload::Task(task.clone()),
            )
            .await?;
        self.metrics.record_dead_letter(stage);

        Ok(entry.id)
    }
}
