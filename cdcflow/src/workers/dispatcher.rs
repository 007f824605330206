use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use cdcflow_config::shared::{OutboxRelayConfig, WorkflowDefinition};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{Instrument, debug, info, warn};

use crate::bail;
use crate::capture::SourceProgress;
use crate::concurrency::backoff::Backoff;
use crate::concurrency::shutdown::ShutdownTx;
use crate::configuration::ConfigSnapshot;
use crate::dead_letter::DeadLetterSink;
use crate::delivery::circuit::CircuitBreaker;
use crate::delivery::client::EndpointClient;
use crate::delivery::engine::DeliveryEngine;
use crate::error::{ErrorKind, FlowResult};
use crate::metrics::WorkflowMetrics;
use crate::outbox::OutboxRelay;
use crate::store::StateStore;
use crate::transform::TransformerRegistry;
use crate::transform::executor::TransformationExecutor;
use crate::types::{ChangeEvent, SourceId, WorkflowHealth, WorkflowId};
use crate::workers::base::WorkerType;
use crate::workers::health::HealthReporter;
use crate::workers::pool::WorkerPool;
use crate::workers::workflow::{WorkItem, WorkflowLane};

/// Held by every task of a lane. The lane has finished once all of them are dropped.
type LaneGuard = Arc<watch::Sender<()>>;

/// Runs `task` holding `guard`, once every task of the `predecessor` lane completed.
async fn after_predecessor<F>(
    guard: LaneGuard,
    predecessor: Option<watch::Receiver<()>>,
    task: F,
) -> F::Output
where
    F: Future,
{
    let _guard = guard;
    if let Some(mut predecessor) = predecessor {
        debug!("waiting for the retired lane of the workflow to finish");
        while predecessor.changed().await.is_ok() {}
    }

    task.await
}

#[derive(Debug)]
struct LaneHandle {
    items_tx: mpsc::UnboundedSender<WorkItem>,
    definition_tx: watch::Sender<Arc<WorkflowDefinition>>,
    breaker: CircuitBreaker,
    metrics: Arc<WorkflowMetrics>,
    health: HealthReporter,
    guard: LaneGuard,
    /// Retired lane of the same workflow that must finish before this one starts.
    predecessor: Option<watch::Receiver<()>>,
    relay_started: bool,
}

/// Owns the lanes of the workflows of one source and hands changes to them.
///
/// Lanes are started, updated and retired by [`WorkflowDispatcher::reconcile`] so that they
/// match the active configuration snapshot. A retired lane finishes the changes already
/// queued to it and then stops. When its workflow comes back before that, the new lane and
/// its relay wait for the retired one to finish, so there is never more than one lane moving
/// the checkpoint of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDispatcher<S, E> {
    source_id: SourceId,
    store: S,
    client: E,
    registry: TransformerRegistry,
    progress: SourceProgress<S>,
    relay_config: OutboxRelayConfig,
    store_backoff: Backoff,
    pool: WorkerPool,
    shutdown_tx: ShutdownTx,
    lanes: Arc<Mutex<HashMap<WorkflowId, LaneHandle>>>,
    /// Completion of retired lanes that may still be draining.
    retired: Arc<Mutex<HashMap<WorkflowId, watch::Receiver<()>>>>,
}

impl<S, E> WorkflowDispatcher<S, E>
where
    S: StateStore,
    E: EndpointClient + Clone + Send + Sync + 'static,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        source_id: SourceId,
        store: S,
        client: E,
        registry: TransformerRegistry,
        progress: SourceProgress<S>,
        relay_config: OutboxRelayConfig,
        store_backoff: Backoff,
        pool: WorkerPool,
        shutdown_tx: ShutdownTx,
    ) -> Self {
        Self {
            source_id,
            store,
            client,
            registry,
            progress,
            relay_config,
            store_backoff,
            pool,
            shutdown_tx,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            retired: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Aligns the running lanes with the workflows of this source in `snapshot`.
    pub async fn reconcile(&self, snapshot: &ConfigSnapshot) {
        let mut lanes = self.lanes.lock().await;
        let mut retired = self.retired.lock().await;
        retired.retain(|_, finished| finished.has_changed().is_ok());

        let active: HashSet<&WorkflowId> = snapshot
            .for_source(&self.source_id)
            .map(|definition| &definition.workflow_id)
            .collect();
        lanes.retain(|workflow_id, lane| {
            let keep = active.contains(workflow_id);
            if !keep {
                info!(%workflow_id, "retiring workflow lane");
                retired.insert(workflow_id.clone(), lane.guard.subscribe());
            }
            keep
        });

        for definition in snapshot.for_source(&self.source_id) {
            let workflow_id = definition.workflow_id.clone();
            match lanes.get_mut(&workflow_id) {
                Some(lane) => {
                    if **lane.definition_tx.borrow() != **definition {
                        info!(%workflow_id, version = snapshot.version(), "updating workflow lane");
                        lane.breaker
                            .set_config(definition.delivery.circuit_breaker.clone())
                            .await;
                        lane.definition_tx.send_replace(definition.clone());
                    }

                    if definition.is_exactly_once() && !lane.relay_started {
                        self.start_relay(lane).await;
                    }
                }
                None => {
                    let predecessor = retired.remove(&workflow_id);
                    let lane = self.start_lane(definition.clone(), predecessor).await;
                    lanes.insert(workflow_id, lane);
                }
            }
        }
    }

    /// Queues a captured change to the lane of `definition`.
    ///
    /// A change for a lane that stopped is not processed; it stays below the source watermark
    /// and is captured again after a restart.
    pub async fn dispatch(&self, definition: Arc<WorkflowDefinition>, event: Arc<ChangeEvent>) {
        let lanes = self.lanes.lock().await;
        let workflow_id = definition.workflow_id.clone();

        let Some(lane) = lanes.get(&workflow_id) else {
            warn!(%workflow_id, "no lane for routed workflow, change not dispatched");
            return;
        };

        if lane
            .items_tx
            .send(WorkItem::Captured { definition, event })
            .is_err()
        {
            warn!(%workflow_id, "workflow lane stopped, change not dispatched");
        }
    }

    /// Queues a dead letter replay to the lane of `workflow_id`.
    pub async fn enqueue_replay(&self, workflow_id: &WorkflowId, item: WorkItem) -> FlowResult<()> {
        let lanes = self.lanes.lock().await;

        let Some(lane) = lanes.get(workflow_id) else {
            bail!(
                ErrorKind::WorkflowNotFound,
                "Workflow is not active on this source",
                format!("workflow {workflow_id} on source {}", self.source_id)
            );
        };

        if lane.items_tx.send(item).is_err() {
            bail!(
                ErrorKind::InvalidState,
                "Workflow lane is stopped",
                format!("workflow {workflow_id}")
            );
        }

        Ok(())
    }

    /// Marks every lane stopped, used when the source failed.
    pub async fn stop_all(&self, reason: &str) {
        let lanes = self.lanes.lock().await;
        for lane in lanes.values() {
            lane.health.set(WorkflowHealth::Stopped {
                reason: reason.to_string(),
            });
        }
    }

    pub async fn health(&self) -> BTreeMap<WorkflowId, WorkflowHealth> {
        let lanes = self.lanes.lock().await;
        lanes
            .iter()
            .map(|(workflow_id, lane)| (workflow_id.clone(), lane.health.current()))
            .collect()
    }

    pub async fn workflow_metrics(&self, workflow_id: &WorkflowId) -> Option<Arc<WorkflowMetrics>> {
        let lanes = self.lanes.lock().await;
        lanes.get(workflow_id).map(|lane| lane.metrics.clone())
    }

    pub async fn definition(&self, workflow_id: &WorkflowId) -> Option<Arc<WorkflowDefinition>> {
        let lanes = self.lanes.lock().await;
        lanes
            .get(workflow_id)
            .map(|lane| lane.definition_tx.borrow().clone())
    }

    fn engine(&self, lane: &LaneHandle) -> DeliveryEngine<S, E> {
        DeliveryEngine::new(
            self.client.clone(),
            self.store.clone(),
            lane.breaker.clone(),
            lane.metrics.clone(),
            lane.health.clone(),
        )
    }

    async fn start_lane(
        &self,
        definition: Arc<WorkflowDefinition>,
        predecessor: Option<watch::Receiver<()>>,
    ) -> LaneHandle {
        let workflow_id = definition.workflow_id.clone();
        let (items_tx, items_rx) = mpsc::unbounded_channel();
        let (definition_tx, definition_rx) = watch::channel(definition.clone());
        let (guard, _) = watch::channel(());

        let mut lane = LaneHandle {
            items_tx,
            definition_tx,
            breaker: CircuitBreaker::new(
                workflow_id.clone(),
                definition.delivery.circuit_breaker.clone(),
            ),
            metrics: WorkflowMetrics::new(self.source_id.clone(), workflow_id.clone()),
            health: HealthReporter::new(workflow_id.clone()),
            guard: Arc::new(guard),
            predecessor,
            relay_started: false,
        };

        let worker = WorkflowLane::new(
            self.source_id.clone(),
            definition_rx,
            items_rx,
            TransformationExecutor::new(
                self.registry.clone(),
                DeadLetterSink::new(self.store.clone()),
                lane.metrics.clone(),
            ),
            self.engine(&lane),
            self.store.clone(),
            self.progress.clone(),
            lane.metrics.clone(),
            self.store_backoff.clone(),
            self.shutdown_tx.subscribe(),
        );
        let span = tracing::info_span!(
            "workflow_lane",
            source_id = %self.source_id,
            workflow_id = %workflow_id
        );
        let run = after_predecessor(lane.guard.clone(), lane.predecessor.clone(), worker.run());
        self.pool
            .spawn(
                WorkerType::Workflow {
                    workflow_id: workflow_id.clone(),
                },
                run.instrument(span),
            )
            .await;

        if definition.is_exactly_once() {
            self.start_relay(&mut lane).await;
        }

        info!(%workflow_id, guarantee = %definition.guarantee, "started workflow lane");

        lane
    }

    async fn start_relay(&self, lane: &mut LaneHandle) {
        let relay = OutboxRelay::new(
            lane.definition_tx.subscribe(),
            self.engine(lane),
            self.store.clone(),
            self.relay_config.clone(),
        );
        let workflow_id = lane.definition_tx.borrow().workflow_id.clone();
        let span = tracing::info_span!(
            "outbox_relay",
            source_id = %self.source_id,
            workflow_id = %workflow_id
        );
        let run = after_predecessor(
            lane.guard.clone(),
            lane.predecessor.clone(),
            relay.run(self.shutdown_tx.subscribe()),
        );
        self.pool
            .spawn(WorkerType::OutboxRelay { workflow_id }, run.instrument(span))
            .await;

        lane.relay_started = true;
    }
}
