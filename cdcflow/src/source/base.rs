use std::future::Future;

use futures::stream::BoxStream;

use crate::error::FlowResult;
use crate::types::{ChangeEvent, SequenceToken, SourceId};

/// Stream of changes read from a source.
///
/// An `Err` item means the read failed; the stream may end after it and the caller
/// reconnects through [`ChangeSource::read_since`].
pub type ChangeEventStream = BoxStream<'static, FlowResult<ChangeEvent>>;

/// A source of ordered row changes.
///
/// Sequence tokens handed out by a source are strictly increasing and stable: reading
/// again from an earlier token yields the same events with the same tokens.
pub trait ChangeSource {
    fn source_id(&self) -> &SourceId;

    /// Opens a stream of every change after `after`, or of every retained change when
    /// `after` is `None`. The stream waits for new changes instead of ending.
    fn read_since(
        &self,
        after: Option<SequenceToken>,
    ) -> impl Future<Output = FlowResult<ChangeEventStream>> + Send;

    /// Returns the token of the newest change, `None` when the source is empty.
    fn latest_token(&self) -> impl Future<Output = FlowResult<Option<SequenceToken>>> + Send;
}
