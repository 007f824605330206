use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::capture::{CaptureStream, SourceProgress};
use crate::concurrency::shutdown::ShutdownRx;
use crate::configuration::ConfigSnapshot;
use crate::delivery::client::EndpointClient;
use crate::error::{FlowError, FlowResult};
use crate::metrics::SourceMetrics;
use crate::router::WorkflowRouter;
use crate::store::StateStore;
use crate::types::{ChangeEvent, SourceId};
use crate::workers::dispatcher::WorkflowDispatcher;

/// Reads the capture stream of a source and fans each change out to its workflows.
///
/// Every change is registered with the [`SourceProgress`] before it is dispatched, so the
/// source checkpoint never passes a change some workflow still owes. Configuration reloads
/// are applied between changes: a change is routed with exactly one snapshot.
///
/// The worker stops when the source failed or when a change cannot be registered. Every
/// workflow of the source is then reported stopped, since none of them receives changes
/// anymore.
#[derive(Debug)]
pub struct CaptureWorker<S, E> {
    source_id: SourceId,
    config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    router: WorkflowRouter,
    dispatcher: WorkflowDispatcher<S, E>,
    progress: SourceProgress<S>,
    metrics: Arc<SourceMetrics>,
    shutdown_rx: ShutdownRx,
}

impl<S, E> CaptureWorker<S, E>
where
    S: StateStore,
    E: EndpointClient + Clone + Send + Sync + 'static,
{
    pub fn new(
        source_id: SourceId,
        config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
        router: WorkflowRouter,
        dispatcher: WorkflowDispatcher<S, E>,
        progress: SourceProgress<S>,
        metrics: Arc<SourceMetrics>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            source_id,
            config_rx,
            router,
            dispatcher,
            progress,
            metrics,
            shutdown_rx,
        }
    }

    /// Consumes `stream` until shutdown, or until the source failed.
    pub async fn run(mut self, mut stream: CaptureStream) -> FlowResult<()> {
        info!(source_id = %self.source_id, "starting capture worker");

        let mut config_open = true;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait() => {
                    info!(source_id = %self.source_id, "shutting down capture worker");
                    break;
                }
                changed = self.config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        // The configuration store is gone, the last snapshot stays active.
                        config_open = false;
                        continue;
                    }

                    let snapshot = self.config_rx.borrow_and_update().clone();
                    info!(
                        source_id = %self.source_id,
                        version = snapshot.version(),
                        "applying workflow configuration"
                    );
                    self.dispatcher.reconcile(&snapshot).await;
                    self.router.update(snapshot);
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if let Err(err) = self.handle_event(event).await {
                            return Err(self.stop(err).await);
                        }
                    }
                    Some(Err(err)) => return Err(self.stop(err).await),
                    None => break,
                },
            }
        }

        Ok(())
    }

    async fn stop(&self, err: FlowError) -> FlowError {
        error!(
            alert = true,
            source_id = %self.source_id,
            error = %err,
            "capture failed, stopping every workflow of the source"
        );
        self.dispatcher.stop_all(&err.summary()).await;

        err
    }

    async fn handle_event(&self, event: ChangeEvent) -> FlowResult<()> {
        self.metrics.record_captured();

        let definitions = self.router.route(&event);
        if definitions.is_empty() {
            self.metrics.record_unrouted();
            debug!(
                source_id = %self.source_id,
                table = %event.table,
                sequence_token = %event.sequence_token,
                "change matched no workflow, dropping it"
            );
        }

        self.progress
            .register(
                event.sequence_token,
                definitions
                    .iter()
                    .map(|definition| definition.workflow_id.clone()),
            )
            .await?;

        let event = Arc::new(event);
        for definition in definitions {
            self.dispatcher.dispatch(definition, event.clone()).await;
        }

        Ok(())
    }
}
