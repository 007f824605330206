use std::future::Future;

use crate::error::FlowResult;
use crate::types::{Checkpoint, CheckpointScope, SourceId};

/// Persists [`Checkpoint`]s.
///
/// Writes must be guarded: a checkpoint never moves backwards, regardless of the order in
/// which concurrent writers land.
pub trait CheckpointStore {
    fn get_checkpoint(
        &self,
        source_id: &SourceId,
        scope: &CheckpointScope,
    ) -> impl Future<Output = FlowResult<Option<Checkpoint>>> + Send;

    /// Returns every checkpoint of a source, the source scope included.
    fn get_checkpoints(
        &self,
        source_id: &SourceId,
    ) -> impl Future<Output = FlowResult<Vec<Checkpoint>>> + Send;

    /// Stores `checkpoint` if it is ahead of the stored one.
    ///
    /// Returns `false`, leaving the store untouched, when the stored token is equal or
    /// greater.
    fn advance_checkpoint(
        &self,
        checkpoint: Checkpoint,
    ) -> impl Future<Output = FlowResult<bool>> + Send;
}
