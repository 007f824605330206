//! Terminal storage for items that exhausted their retries, and their manual replay.

use std::future::Future;

use chrono::Utc;
use tracing::{info, warn};

use crate::bail;
use crate::error::{ErrorKind, FlowResult};
use crate::store::DeadLetterStore;
use crate::types::{DeadLetterEntry, DeadLetterId, DeadLetterPayload, DeadLetterStage, WorkflowId};

/// Puts a dead lettered item back at the stage that gave up on it.
pub trait ReplayInjector {
    fn inject(&self, entry: &DeadLetterEntry) -> impl Future<Output = FlowResult<()>> + Send;
}

/// Records dead letters and replays them on request.
///
/// Entries are only ever added; replaying an entry keeps it and bumps its replay counter.
/// Nothing is replayed automatically.
#[derive(Debug, Clone)]
pub struct DeadLetterSink<S> {
    store: S,
}

impl<S> DeadLetterSink<S>
where
    S: DeadLetterStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persists a new entry for `payload`, which `stage` gave up on after `attempts`.
    pub async fn record(
        &self,
        workflow_id: &WorkflowId,
        stage: DeadLetterStage,
        reason: String,
        attempts: u32,
        payload: DeadLetterPayload,
    ) -> FlowResult<DeadLetterEntry> {
        let entry = DeadLetterEntry::new(workflow_id.clone(), stage, reason, attempts, payload);
        self.store.insert_dead_letter(entry.clone()).await?;

        warn!(
            %workflow_id,
            dead_letter_id = %entry.id,
            %stage,
            attempts,
            reason = %entry.reason,
            "moved item to dead letter sink"
        );

        Ok(entry)
    }

    pub async fn get(&self, id: DeadLetterId) -> FlowResult<DeadLetterEntry> {
        match self.store.get_dead_letter(id).await? {
            Some(entry) => Ok(entry),
            None => bail!(
                ErrorKind::DeadLetterNotFound,
                "Dead letter entry does not exist",
                id
            ),
        }
    }

    /// Lists entries oldest first, optionally for one workflow only.
    pub async fn list(&self, workflow_id: Option<&WorkflowId>) -> FlowResult<Vec<DeadLetterEntry>> {
        self.store.list_dead_letters(workflow_id).await
    }

    /// Re-injects an entry at its originating stage and records the replay.
    ///
    /// The replay is only recorded once the injector accepted the entry.
    pub async fn replay<I>(&self, id: DeadLetterId, injector: &I) -> FlowResult<DeadLetterEntry>
    where
        I: ReplayInjector + Sync,
    {
        let entry = self.get(id).await?;
        injector.inject(&entry).await?;

        let entry = self.store.record_dead_letter_replay(id, Utc::now()).await?;
        info!(
            workflow_id = %entry.workflow_id,
            dead_letter_id = %id,
            stage = %entry.stage,
            replay_count = entry.replay_count,
            "replayed dead letter"
        );

        Ok(entry)
    }
}
