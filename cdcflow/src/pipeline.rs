use std::collections::BTreeMap;
use std::sync::Arc;

use cdcflow_config::shared::PipelineConfig;
use chrono::Utc;
use tracing::{Instrument, info};

use crate::bail;
use crate::capture::{ChangeCaptureAdapter, SourceProgress};
use crate::concurrency::backoff::Backoff;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::configuration::ConfigurationStore;
use crate::dead_letter::{DeadLetterSink, ReplayInjector};
use crate::delivery::client::EndpointClient;
use crate::error::{ErrorKind, FlowResult};
use crate::metrics::{SourceMetrics, WorkflowMetrics, register_metrics};
use crate::router::WorkflowRouter;
use crate::source::ChangeSource;
use crate::store::StateStore;
use crate::transform::TransformerRegistry;
use crate::types::{
    ChangeEvent, DeadLetterEntry, DeadLetterId, DeadLetterPayload, DeadLetterStage,
    SequenceToken, SourceId, WorkflowHealth, WorkflowId,
};
use crate::workers::base::WorkerType;
use crate::workers::capture::CaptureWorker;
use crate::workers::dispatcher::WorkflowDispatcher;
use crate::workers::pool::WorkerPool;
use crate::workers::workflow::WorkItem;

#[derive(Debug)]
enum PipelineState<S, E> {
    NotStarted,
    Started {
        dispatcher: WorkflowDispatcher<S, E>,
        progress: SourceProgress<S>,
        metrics: Arc<SourceMetrics>,
    },
}

/// Captures the changes of one source and runs every workflow reading from it.
#[derive(Debug)]
pub struct Pipeline<Src, S, C, E> {
    config: Arc<PipelineConfig>,
    source: Src,
    store: S,
    config_store: C,
    registry: TransformerRegistry,
    client: E,
    pool: WorkerPool,
    state: PipelineState<S, E>,
    shutdown_tx: ShutdownTx,
}

impl<Src, S, C, E> Pipeline<Src, S, C, E>
where
    Src: ChangeSource + Clone + Send + Sync + 'static,
    S: StateStore,
    C: ConfigurationStore,
    E: EndpointClient + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: PipelineConfig,
        source: Src,
        store: S,
        config_store: C,
        registry: TransformerRegistry,
        client: E,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            config: Arc::new(config),
            source,
            store,
            config_store,
            registry,
            client,
            pool: WorkerPool::new(),
            state: PipelineState::NotStarted,
            shutdown_tx,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.config.source_id
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Starts the lanes of the active workflows, then capture from the stored checkpoint.
    pub async fn start(&mut self) -> FlowResult<()> {
        if !matches!(self.state, PipelineState::NotStarted) {
            bail!(ErrorKind::InvalidState, "Pipeline was already started");
        }

        let source_id = self.config.source_id.clone();
        info!(%source_id, "starting pipeline");

        register_metrics();
        self.config.validate()?;

        if self.source.source_id() != &source_id {
            bail!(
                ErrorKind::ConfigError,
                "Change source does not match the pipeline",
                format!(
                    "pipeline for source {source_id} was given source {}",
                    self.source.source_id()
                )
            );
        }

        let mut config_rx = self.config_store.subscribe();
        let snapshot = config_rx.borrow_and_update().clone();

        let adapter = ChangeCaptureAdapter::new(
            self.source.clone(),
            self.store.clone(),
            self.config.capture.clone(),
        );
        let resume_from = adapter.resume_point().await?;

        let metrics = SourceMetrics::new(source_id.clone());
        let store_backoff = Backoff::new(self.config.store_retry.clone());
        let progress = SourceProgress::new(
            source_id.clone(),
            self.store.clone(),
            store_backoff.clone(),
            metrics.clone(),
            resume_from,
        );

        let dispatcher = WorkflowDispatcher::new(
            source_id.clone(),
            self.store.clone(),
            self.client.clone(),
            self.registry.clone(),
            progress.clone(),
            self.config.outbox_relay.clone(),
            store_backoff,
            self.pool.clone(),
            self.shutdown_tx.clone(),
        );
        dispatcher.reconcile(&snapshot).await;

        let worker = CaptureWorker::new(
            source_id.clone(),
            config_rx,
            WorkflowRouter::new(source_id.clone(), snapshot),
            dispatcher.clone(),
            progress.clone(),
            metrics.clone(),
            self.shutdown_tx.subscribe(),
        );
        let stream = adapter.start_capture(resume_from);

        // Lanes and relays only stop on shutdown, so a failed source must trigger it.
        let shutdown_tx = self.shutdown_tx.clone();
        let capture = async move {
            let result = worker.run(stream).await;
            if result.is_err() {
                shutdown_tx.shutdown();
            }

            result
        };
        let span = tracing::info_span!("capture", source_id = %source_id);
        self.pool
            .spawn(WorkerType::Capture, capture.instrument(span))
            .await;

        self.state = PipelineState::Started {
            dispatcher,
            progress,
            metrics,
        };

        Ok(())
    }

    /// Waits for every worker to finish and returns their aggregated errors.
    pub async fn wait(self) -> FlowResult<()> {
        if matches!(self.state, PipelineState::NotStarted) {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        }

        info!(source_id = %self.config.source_id, "waiting for pipeline workers to complete");

        let result = self.pool.wait_all().await;
        if let Err(err) = &result {
            info!(
                source_id = %self.config.source_id,
                failed_workers = err.kinds().len(),
                "pipeline completed with errors"
            );
        }

        result
    }

    pub fn shutdown(&self) {
        info!(source_id = %self.config.source_id, "shutting down pipeline");

        self.shutdown_tx.shutdown();
    }

    pub async fn shutdown_and_wait(self) -> FlowResult<()> {
        self.shutdown();
        self.wait().await
    }

    pub fn dead_letters(&self) -> DeadLetterSink<S> {
        DeadLetterSink::new(self.store.clone())
    }

    /// Re-injects a dead letter at the stage that gave up on it.
    ///
    /// The workflow of the entry must be active on this pipeline. The entry is kept and its
    /// replay counter bumped.
    pub async fn replay_dead_letter(&self, id: DeadLetterId) -> FlowResult<DeadLetterEntry> {
        let PipelineState::Started { dispatcher, .. } = &self.state else {
            bail!(
                ErrorKind::InvalidState,
                "Pipeline is not started",
                "dead letters can only be replayed into a running pipeline"
            );
        };

        let injector = PipelineReplayInjector {
            dispatcher,
            store: &self.store,
        };

        self.dead_letters().replay(id, &injector).await
    }

    /// Health of every active workflow of the source.
    pub async fn health(&self) -> BTreeMap<WorkflowId, WorkflowHealth> {
        match &self.state {
            PipelineState::NotStarted => BTreeMap::new(),
            PipelineState::Started { dispatcher, .. } => dispatcher.health().await,
        }
    }

    pub async fn workflow_metrics(&self, workflow_id: &WorkflowId) -> Option<Arc<WorkflowMetrics>> {
        match &self.state {
            PipelineState::NotStarted => None,
            PipelineState::Started { dispatcher, .. } => {
                dispatcher.workflow_metrics(workflow_id).await
            }
        }
    }

    pub fn source_metrics(&self) -> Option<Arc<SourceMetrics>> {
        match &self.state {
            PipelineState::NotStarted => None,
            PipelineState::Started { metrics, .. } => Some(metrics.clone()),
        }
    }

    /// Low watermark of the source: every change up to it is finished for every workflow.
    pub async fn watermark(&self) -> Option<SequenceToken> {
        match &self.state {
            PipelineState::NotStarted => None,
            PipelineState::Started { progress, .. } => progress.watermark().await,
        }
    }
}

struct PipelineReplayInjector<'a, S, E> {
    dispatcher: &'a WorkflowDispatcher<S, E>,
    store: &'a S,
}

impl<S, E> ReplayInjector for PipelineReplayInjector<'_, S, E>
where
    S: StateStore,
    E: EndpointClient + Clone + Send + Sync + 'static,
{
    async fn inject(&self, entry: &DeadLetterEntry) -> FlowResult<()> {
        let workflow_id = &entry.workflow_id;

        match (entry.stage, &entry.payload) {
            (DeadLetterStage::Transform, DeadLetterPayload::Event(envelope)) => {
                let event = ChangeEvent::try_from(envelope.clone())?;
                self.dispatcher
                    .enqueue_replay(workflow_id, WorkItem::ReplayEvent { event })
                    .await
            }
            (DeadLetterStage::Delivery, DeadLetterPayload::Task(task)) => {
                self.dispatcher
                    .enqueue_replay(workflow_id, WorkItem::ReplayTask { task: task.clone() })
                    .await
            }
            (DeadLetterStage::OutboxRelay, DeadLetterPayload::Task(task)) => {
                if self.dispatcher.definition(workflow_id).await.is_none() {
                    bail!(
                        ErrorKind::WorkflowNotFound,
                        "Workflow is not active on this source",
                        format!("workflow {workflow_id}")
                    );
                }

                let Some(mut record) = self
                    .store
                    .get_outbox_record(workflow_id, &task.idempotency_key)
                    .await?
                else {
                    bail!(
                        ErrorKind::InvalidState,
                        "Outbox record of the dead letter is missing",
                        format!("workflow {workflow_id}, key {}", task.idempotency_key)
                    );
                };

                // The relay picks the record up on its next poll.
                record.task.reset_for_replay();
                record.next_attempt_at = Utc::now();
                record.last_error = None;

                self.store.update_outbox_record(&record).await
            }
            (stage, _) => bail!(
                ErrorKind::InvalidData,
                "Dead letter payload does not match its stage",
                format!("entry {} of stage {stage}", entry.id)
            ),
        }
    }
}
