use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::concurrency::backoff::Backoff;
use crate::concurrency::retry::retry_transient;
use crate::error::FlowResult;
use crate::metrics::SourceMetrics;
use crate::store::CheckpointStore;
use crate::types::{Checkpoint, SequenceToken, SourceId, WorkflowId};

#[derive(Debug, Default)]
struct ProgressInner {
    /// Captured changes still owed by at least one workflow, plus settled changes that
    /// wait behind an unsettled one.
    pending: BTreeMap<SequenceToken, HashSet<WorkflowId>>,
    last_captured: Option<SequenceToken>,
    watermark: Option<SequenceToken>,
    /// Last watermark written to the store. Trails `watermark` after a failed write.
    persisted: Option<SequenceToken>,
}

impl ProgressInner {
    /// Pops settled changes from the front and moves the watermark over them.
    fn settle(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().is_empty() {
                break;
            }
            self.watermark = Some(entry.remove_entry().0);
        }
    }

    /// Watermark that still has to be written to the store.
    fn unpersisted(&self) -> Option<SequenceToken> {
        self.watermark
            .filter(|watermark| self.persisted.is_none_or(|persisted| *watermark > persisted))
    }

    fn lag(&self) -> u64 {
        match (self.watermark, self.last_captured) {
            (Some(watermark), Some(last)) => watermark.distance_to(last),
            (None, Some(last)) => last.value(),
            _ => 0,
        }
    }
}

/// Tracks which workflows still owe a terminal outcome for each captured change and
/// persists the source checkpoint as the low watermark of those changes.
///
/// A change is registered with its routed workflows before it is dispatched and settles
/// once every one of them acknowledged it. The source checkpoint only moves over settled
/// changes, so a restart never skips a change some workflow did not finish. Writes to the
/// source checkpoint are serialized by the internal lock and retried on transient errors.
/// A watermark whose write failed is written again with the next one.
#[derive(Debug, Clone)]
pub struct SourceProgress<S> {
    source_id: SourceId,
    store: S,
    backoff: Backoff,
    metrics: Arc<SourceMetrics>,
    inner: Arc<Mutex<ProgressInner>>,
}

impl<S> SourceProgress<S>
where
    S: CheckpointStore + Clone + Send + Sync + 'static,
{
    /// Starts tracking after `watermark`, the source checkpoint capture resumed from.
    pub fn new(
        source_id: SourceId,
        store: S,
        backoff: Backoff,
        metrics: Arc<SourceMetrics>,
        watermark: Option<SequenceToken>,
    ) -> Self {
        Self {
            source_id,
            store,
            backoff,
            metrics,
            inner: Arc::new(Mutex::new(ProgressInner {
                watermark,
                last_captured: watermark,
                persisted: watermark,
                ..ProgressInner::default()
            })),
        }
    }

    /// Registers a captured change owed by `workflows`.
    ///
    /// A change routed nowhere settles immediately.
    pub async fn register(
        &self,
        token: SequenceToken,
        workflows: impl IntoIterator<Item = WorkflowId>,
    ) -> FlowResult<()> {
        let mut inner = self.inner.lock().await;
        inner.pending.insert(token, workflows.into_iter().collect());
        inner.last_captured = Some(token);

        inner.settle();
        self.persist(&mut inner).await
    }

    /// Acknowledges that `workflow_id` is done with the change at `token`.
    pub async fn ack(&self, token: SequenceToken, workflow_id: &WorkflowId) -> FlowResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(owed_by) = inner.pending.get_mut(&token) {
            owed_by.remove(workflow_id);
        }

        inner.settle();
        self.persist(&mut inner).await
    }

    pub async fn watermark(&self) -> Option<SequenceToken> {
        self.inner.lock().await.watermark
    }

    pub async fn last_captured(&self) -> Option<SequenceToken> {
        self.inner.lock().await.last_captured
    }

    async fn persist(&self, inner: &mut ProgressInner) -> FlowResult<()> {
        self.metrics.set_checkpoint_lag(inner.lag());

        let Some(watermark) = inner.unpersisted() else {
            return Ok(());
        };

        let checkpoint = Checkpoint::source(self.source_id.clone(), watermark);
        retry_transient(&self.backoff, "advance source checkpoint", || {
            self.store.advance_checkpoint(checkpoint.clone())
        })
        .await?;
        inner.persisted = Some(watermark);

        debug!(source_id = %self.source_id, %watermark, "advanced source checkpoint");

        Ok(())
    }
}
