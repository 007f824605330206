use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::FlowResult;
use crate::types::{IdempotencyKey, OutboxRecord, WorkflowId};

/// Transactional outbox of exactly-once workflows.
///
/// Records are keyed by workflow and idempotency key and are never removed by the
/// pipeline; delivered records stay with status `delivered`.
pub trait OutboxStore {
    /// Inserts `record` and advances its workflow checkpoint in one transaction.
    ///
    /// When a record with the same key exists it is kept as is, but the checkpoint is still
    /// advanced. Returns whether a new record was written.
    fn insert_outbox_record(
        &self,
        record: OutboxRecord,
    ) -> impl Future<Output = FlowResult<bool>> + Send;

    fn get_outbox_record(
        &self,
        workflow_id: &WorkflowId,
        idempotency_key: &IdempotencyKey,
    ) -> impl Future<Output = FlowResult<Option<OutboxRecord>>> + Send;

    /// Returns up to `limit` non terminal records due at `now`, oldest first.
    fn poll_due_outbox_records(
        &self,
        workflow_id: &WorkflowId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = FlowResult<Vec<OutboxRecord>>> + Send;

    /// Writes the task status, attempt count, next attempt time and last error of `record`.
    fn update_outbox_record(
        &self,
        record: &OutboxRecord,
    ) -> impl Future<Output = FlowResult<()>> + Send;

    /// Returns every record of a workflow, oldest first.
    fn list_outbox_records(
        &self,
        workflow_id: &WorkflowId,
    ) -> impl Future<Output = FlowResult<Vec<OutboxRecord>>> + Send;
}
