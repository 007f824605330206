use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::store::{CheckpointStore, DeadLetterStore, OutboxStore};
use crate::types::{
    Checkpoint, CheckpointScope, DeadLetterEntry, DeadLetterId, IdempotencyKey, OutboxRecord,
    SourceId, WorkflowId,
};

#[derive(Debug, Default)]
struct Inner {
    checkpoints: HashMap<(SourceId, CheckpointScope), Checkpoint>,
    outbox: BTreeMap<(WorkflowId, IdempotencyKey), OutboxRecord>,
    dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
    /// Remaining scripted failures of checkpoint writes, per scope.
    checkpoint_write_failures: HashMap<CheckpointScope, (usize, ErrorKind)>,
}

impl Inner {
    /// Fails if a failure is scripted for writes of `scope`.
    fn scripted_failure(&mut self, scope: &CheckpointScope) -> FlowResult<()> {
        let Some((remaining, kind)) = self.checkpoint_write_failures.get_mut(scope) else {
            return Ok(());
        };

        let kind = *kind;
        *remaining -= 1;
        if *remaining == 0 {
            self.checkpoint_write_failures.remove(scope);
        }

        Err(flow_error!(
            kind,
            "Scripted checkpoint write failure",
            format!("scope {scope}")
        ))
    }

    fn advance_checkpoint(&mut self, checkpoint: Checkpoint) -> bool {
        let key = (checkpoint.source_id.clone(), checkpoint.scope.clone());
        match self.checkpoints.get(&key) {
            Some(current) if current.sequence_token >= checkpoint.sequence_token => false,
            _ => {
                self.checkpoints.insert(key, checkpoint);
                true
            }
        }
    }
}

/// In-memory implementation of every store trait.
///
/// A single lock guards all the state, which makes the outbox insert and its checkpoint
/// advance atomic. Clones share the same state, so dropping a pipeline and starting a new
/// one on a clone behaves like a process restart with durable state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes of a checkpoint with `scope` fail with `kind`, outbox
    /// inserts advancing such a checkpoint included. Nothing is stored by a failed write.
    pub async fn fail_next_checkpoint_writes(
        &self,
        scope: CheckpointScope,
        count: usize,
        kind: ErrorKind,
    ) {
        let mut inner = self.inner.lock().await;
        if count == 0 {
            inner.checkpoint_write_failures.remove(&scope);
        } else {
            inner.checkpoint_write_failures.insert(scope, (count, kind));
        }
    }
}

impl CheckpointStore for MemoryStore {
    async fn get_checkpoint(
        &self,
        source_id: &SourceId,
        scope: &CheckpointScope,
    ) -> FlowResult<Option<Checkpoint>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .checkpoints
            .get(&(source_id.clone(), scope.clone()))
            .cloned())
    }

    async fn get_checkpoints(&self, source_id: &SourceId) -> FlowResult<Vec<Checkpoint>> {
        let inner = self.inner.lock().await;

        let mut checkpoints: Vec<_> = inner
            .checkpoints
            .values()
            .filter(|checkpoint| &checkpoint.source_id == source_id)
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| a.scope.cmp(&b.scope));

        Ok(checkpoints)
    }

    async fn advance_checkpoint(&self, checkpoint: Checkpoint) -> FlowResult<bool> {
        let mut inner = self.inner.lock().await;
        inner.scripted_failure(&checkpoint.scope)?;

        Ok(inner.advance_checkpoint(checkpoint))
    }
}

impl OutboxStore for MemoryStore {
    async fn insert_outbox_record(&self, record: OutboxRecord) -> FlowResult<bool> {
        let mut inner = self.inner.lock().await;
        inner.scripted_failure(&record.written_in_transaction_with.scope)?;

        inner.advance_checkpoint(record.written_in_transaction_with.clone());

        let key = (
            record.task.workflow_id.clone(),
            record.task.idempotency_key.clone(),
        );
        if inner.outbox.contains_key(&key) {
            return Ok(false);
        }
        inner.outbox.insert(key, record);

        Ok(true)
    }

    async fn get_outbox_record(
        &self,
        workflow_id: &WorkflowId,
        idempotency_key: &IdempotencyKey,
    ) -> FlowResult<Option<OutboxRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .outbox
            .get(&(workflow_id.clone(), idempotency_key.clone()))
            .cloned())
    }

    async fn poll_due_outbox_records(
        &self,
        workflow_id: &WorkflowId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> FlowResult<Vec<OutboxRecord>> {
        let inner = self.inner.lock().await;

        let mut due: Vec<_> = inner
            .outbox
            .iter()
            .filter(|((id, _), record)| id == workflow_id && record.is_due(now))
            .map(|(_, record)| record.clone())
            .collect();
        due.sort_by_key(|record| (record.created_at(), record.task.sequence_token));
        due.truncate(limit);

        Ok(due)
    }

    async fn update_outbox_record(&self, record: &OutboxRecord) -> FlowResult<()> {
        let mut inner = self.inner.lock().await;

        let key = (
            record.task.workflow_id.clone(),
            record.task.idempotency_key.clone(),
        );
        let stored = inner.outbox.get_mut(&key).ok_or_else(|| {
            flow_error!(
                ErrorKind::InvalidState,
                "Outbox record does not exist",
                format!("workflow {} key {}", key.0, key.1)
            )
        })?;

        stored.task.status = record.task.status;
        stored.task.attempt_count = record.task.attempt_count;
        stored.next_attempt_at = record.next_attempt_at;
        stored.last_error = record.last_error.clone();

        Ok(())
    }

    async fn list_outbox_records(&self, workflow_id: &WorkflowId) -> FlowResult<Vec<OutboxRecord>> {
        let inner = self.inner.lock().await;

        let mut records: Vec<_> = inner
            .outbox
            .iter()
            .filter(|((id, _), _)| id == workflow_id)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by_key(|record| (record.created_at(), record.task.sequence_token));

        Ok(records)
    }
}

impl DeadLetterStore for MemoryStore {
    async fn insert_dead_letter(&self, entry: DeadLetterEntry) -> FlowResult<()> {
        let mut inner = self.inner.lock().await;
        inner.dead_letters.insert(entry.id, entry);

        Ok(())
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> FlowResult<Option<DeadLetterEntry>> {
        let inner = self.inner.lock().await;

        Ok(inner.dead_letters.get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        workflow_id: Option<&WorkflowId>,
    ) -> FlowResult<Vec<DeadLetterEntry>> {
        let inner = self.inner.lock().await;

        let mut entries: Vec<_> = inner
            .dead_letters
            .values()
            .filter(|entry| workflow_id.is_none_or(|id| &entry.workflow_id == id))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| (entry.created_at, entry.id));

        Ok(entries)
    }

    async fn record_dead_letter_replay(
        &self,
        id: DeadLetterId,
        replayed_at: DateTime<Utc>,
    ) -> FlowResult<DeadLetterEntry> {
        let mut inner = self.inner.lock().await;

        let entry = inner.dead_letters.get_mut(&id).ok_or_else(|| {
            flow_error!(
                ErrorKind::DeadLetterNotFound,
                "Dead letter entry does not exist",
                id
            )
        })?;
        entry.replay_count += 1;
        entry.last_replayed_at = Some(replayed_at);

        Ok(entry.clone())
    }
}
