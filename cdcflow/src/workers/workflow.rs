use std::sync::Arc;

use cdcflow_config::shared::WorkflowDefinition;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::capture::SourceProgress;
use crate::concurrency::backoff::Backoff;
use crate::concurrency::retry::retry_transient;
use crate::concurrency::shutdown::ShutdownRx;
use crate::delivery::client::EndpointClient;
use crate::delivery::engine::{DeliveryEngine, DeliveryResolution};
use crate::error::FlowResult;
use crate::failpoints::{DELIVERY_BEFORE_CHECKPOINT, flow_fail_point};
use crate::metrics::WorkflowMetrics;
use crate::store::StateStore;
use crate::transform::executor::{TransformOutcome, TransformationExecutor};
use crate::types::{
    ChangeEvent, Checkpoint, CheckpointScope, DeliveryTask, SequenceToken, SourceId,
    WorkflowHealth, WorkflowId,
};

/// Work queued to a workflow lane.
#[derive(Debug)]
pub enum WorkItem {
    /// A captured change, with the definition it was routed with.
    Captured {
        definition: Arc<WorkflowDefinition>,
        event: Arc<ChangeEvent>,
    },
    /// A dead lettered change to transform and deliver again.
    ReplayEvent { event: ChangeEvent },
    /// A dead lettered task to deliver again.
    ReplayTask { task: DeliveryTask },
}

/// Whether the lane keeps going after an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneStep {
    Continue,
    Interrupted,
}

/// Processes the changes routed to one workflow, one at a time and in token order.
///
/// A captured change is finished once it is delivered, dead lettered or, for exactly-once
/// workflows, durably enqueued in the outbox. Only then does the lane checkpoint move and the
/// change get acknowledged to the [`SourceProgress`]. Failures of one lane never block another.
///
/// Checkpoint and outbox writes failing with a transient error are retried with the store
/// backoff. A lane whose write still fails stops and reports itself stopped.
#[derive(Debug)]
pub struct WorkflowLane<S, E> {
    source_id: SourceId,
    workflow_id: WorkflowId,
    definition_rx: watch::Receiver<Arc<WorkflowDefinition>>,
    items_rx: mpsc::UnboundedReceiver<WorkItem>,
    executor: TransformationExecutor<S>,
    engine: DeliveryEngine<S, E>,
    store: S,
    progress: SourceProgress<S>,
    metrics: Arc<WorkflowMetrics>,
    store_backoff: Backoff,
    shutdown_rx: ShutdownRx,
    checkpoint: Option<SequenceToken>,
}

impl<S, E> WorkflowLane<S, E>
where
    S: StateStore,
    E: EndpointClient + Clone + Send + Sync + 'static,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        source_id: SourceId,
        definition_rx: watch::Receiver<Arc<WorkflowDefinition>>,
        items_rx: mpsc::UnboundedReceiver<WorkItem>,
        executor: TransformationExecutor<S>,
        engine: DeliveryEngine<S, E>,
        store: S,
        progress: SourceProgress<S>,
        metrics: Arc<WorkflowMetrics>,
        store_backoff: Backoff,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let workflow_id = definition_rx.borrow().workflow_id.clone();

        Self {
            source_id,
            workflow_id,
            definition_rx,
            items_rx,
            executor,
            engine,
            store,
            progress,
            metrics,
            store_backoff,
            shutdown_rx,
            checkpoint: None,
        }
    }

    /// Processes queued items until shutdown or until the lane's queue is closed and drained.
    pub async fn run(mut self) -> FlowResult<()> {
        self.checkpoint = self
            .store
            .get_checkpoint(
                &self.source_id,
                &CheckpointScope::Workflow(self.workflow_id.clone()),
            )
            .await?
            .map(|checkpoint| checkpoint.sequence_token);

        info!(
            workflow_id = %self.workflow_id,
            checkpoint = ?self.checkpoint,
            "starting workflow lane"
        );

        loop {
            let item = tokio::select! {
                biased;

                _ = self.shutdown_rx.wait() => break,
                item = self.items_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            match self.process(item).await {
                Ok(LaneStep::Continue) => {}
                Ok(LaneStep::Interrupted) => break,
                Err(err) => {
                    error!(workflow_id = %self.workflow_id, error = %err, "workflow lane stopped");
                    self.engine.health().set(WorkflowHealth::Stopped {
                        reason: err.summary(),
                    });

                    return Err(err);
                }
            }
        }

        info!(workflow_id = %self.workflow_id, "workflow lane completed");

        Ok(())
    }

    async fn process(&mut self, item: WorkItem) -> FlowResult<LaneStep> {
        match item {
            WorkItem::Captured { definition, event } => self.process_captured(&definition, &event).await,
            WorkItem::ReplayEvent { event } => {
                let definition = self.definition_rx.borrow().clone();
                info!(
                    workflow_id = %self.workflow_id,
                    sequence_token = %event.sequence_token,
                    "replaying dead lettered change"
                );

                match self
                    .executor
                    .run(&definition, &event, &mut self.shutdown_rx)
                    .await?
                {
                    TransformOutcome::Task(task) => {
                        self.hand_over(&definition, task, event.sequence_token)
                            .await
                    }
                    TransformOutcome::DeadLettered(_) => Ok(LaneStep::Continue),
                    TransformOutcome::Interrupted => Ok(LaneStep::Interrupted),
                }
            }
            WorkItem::ReplayTask { mut task } => {
                let definition = self.definition_rx.borrow().clone();
                info!(
                    workflow_id = %self.workflow_id,
                    idempotency_key = %task.idempotency_key,
                    "replaying dead lettered task"
                );

                task.reset_for_replay();
                match self
                    .engine
                    .deliver_with_retries(&definition, task, &mut self.shutdown_rx)
                    .await?
                {
                    DeliveryResolution::Interrupted => Ok(LaneStep::Interrupted),
                    DeliveryResolution::Delivered | DeliveryResolution::DeadLettered(_) => {
                        Ok(LaneStep::Continue)
                    }
                }
            }
        }
    }

    async fn process_captured(
        &mut self,
        definition: &WorkflowDefinition,
        event: &ChangeEvent,
    ) -> FlowResult<LaneStep> {
        let token = event.sequence_token;

        if self.checkpoint.is_some_and(|checkpoint| token <= checkpoint) {
            debug!(
                workflow_id = %self.workflow_id,
                sequence_token = %token,
                "skipping change already processed by this workflow"
            );
            self.progress.ack(token, &self.workflow_id).await?;

            return Ok(LaneStep::Continue);
        }

        self.metrics.record_routed();

        let task = match self
            .executor
            .run(definition, event, &mut self.shutdown_rx)
            .await?
        {
            TransformOutcome::Task(task) => task,
            TransformOutcome::DeadLettered(_) => {
                self.complete(token, true).await?;
                return Ok(LaneStep::Continue);
            }
            TransformOutcome::Interrupted => return Ok(LaneStep::Interrupted),
        };

        let step = self.hand_over(definition, task, token).await?;
        if step == LaneStep::Continue {
            self.complete(token, !definition.is_exactly_once()).await?;
        }

        Ok(step)
    }

    /// Delivers `task` directly, or enqueues it in the outbox for exactly-once workflows.
    ///
    /// The outbox insert advances the lane checkpoint in the same transaction.
    async fn hand_over(
        &mut self,
        definition: &WorkflowDefinition,
        task: DeliveryTask,
        token: SequenceToken,
    ) -> FlowResult<LaneStep> {
        if definition.is_exactly_once() {
            let engine = &self.engine;
            retry_transient(&self.store_backoff, "enqueue outbox record", || {
                engine.enqueue_exactly_once(task.clone(), token)
            })
            .await?;
            return Ok(LaneStep::Continue);
        }

        match self
            .engine
            .deliver_with_retries(definition, task, &mut self.shutdown_rx)
            .await?
        {
            DeliveryResolution::Interrupted => Ok(LaneStep::Interrupted),
            DeliveryResolution::Delivered | DeliveryResolution::DeadLettered(_) => {
                Ok(LaneStep::Continue)
            }
        }
    }

    /// Marks the change at `token` as finished for this workflow.
    async fn complete(&mut self, token: SequenceToken, write_checkpoint: bool) -> FlowResult<()> {
        if write_checkpoint {
            flow_fail_point(DELIVERY_BEFORE_CHECKPOINT)?;

            let store = &self.store;
            let checkpoint =
                Checkpoint::workflow(self.source_id.clone(), self.workflow_id.clone(), token);
            retry_transient(&self.store_backoff, "advance workflow checkpoint", || {
                store.advance_checkpoint(checkpoint.clone())
            })
            .await?;
        }
        self.checkpoint = Some(token);
        self.progress.ack(token, &self.workflow_id).await?;

        if let Some(last_captured) = self.progress.last_captured().await {
            self.metrics.set_checkpoint_lag(token.distance_to(last_captured));
        }

        Ok(())
    }
}
