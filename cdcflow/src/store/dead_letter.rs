use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::FlowResult;
use crate::types::{DeadLetterEntry, DeadLetterId, WorkflowId};

/// Durable storage of dead letters.
pub trait DeadLetterStore {
    fn insert_dead_letter(
        &self,
        entry: DeadLetterEntry,
    ) -> impl Future<Output = FlowResult<()>> + Send;

    fn get_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> impl Future<Output = FlowResult<Option<DeadLetterEntry>>> + Send;

    /// Lists entries oldest first, optionally restricted to one workflow.
    fn list_dead_letters(
        &self,
        workflow_id: Option<&WorkflowId>,
    ) -> impl Future<Output = FlowResult<Vec<DeadLetterEntry>>> + Send;

    /// Bumps the replay counter of an entry and returns the updated entry.
    ///
    /// Fails with [`crate::error::ErrorKind::DeadLetterNotFound`] for unknown ids.
    fn record_dead_letter_replay(
        &self,
        id: DeadLetterId,
        replayed_at: DateTime<Utc>,
    ) -> impl Future<Output = FlowResult<DeadLetterEntry>> + Send;
}
