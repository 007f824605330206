use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;

use crate::bail;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::source::{ChangeEventStream, ChangeSource};
use crate::types::{ChangeEvent, Operation, RowImage, SequenceToken, SourceId};

#[derive(Debug, Default)]
struct Inner {
    events: Vec<ChangeEvent>,
    /// Errors returned by upcoming `read_since` calls, in order.
    read_failures: VecDeque<ErrorKind>,
    /// Errors yielded by open streams once they caught up, in order.
    stream_failures: VecDeque<ErrorKind>,
}

/// In-memory change source.
///
/// Events are appended with [`MemoryChangeSource::push`] and handed out in token order.
/// Failures can be scripted to exercise reconnection.
#[derive(Debug, Clone)]
pub struct MemoryChangeSource {
    source_id: SourceId,
    inner: Arc<Mutex<Inner>>,
    appended: Arc<watch::Sender<u64>>,
}

impl MemoryChangeSource {
    pub fn new(source_id: SourceId) -> Self {
        let (appended, _) = watch::channel(0);

        Self {
            source_id,
            inner: Arc::new(Mutex::new(Inner::default())),
            appended: Arc::new(appended),
        }
    }

    fn lock(&self) -> FlowResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| flow_error!(ErrorKind::InvalidState, "Memory source lock poisoned"))
    }

    /// Appends an event. Its token must be greater than every token already appended.
    pub fn push(&self, event: ChangeEvent) -> FlowResult<()> {
        {
            let mut inner = self.lock()?;
            if let Some(last) = inner.events.last() {
                if last.sequence_token >= event.sequence_token {
                    bail!(
                        ErrorKind::SourceSequenceRegression,
                        "Change events must have increasing sequence tokens",
                        format!(
                            "token {} does not follow {}",
                            event.sequence_token, last.sequence_token
                        )
                    );
                }
            }
            inner.events.push(event);
        }

        self.appended.send_modify(|count| *count += 1);

        Ok(())
    }

    /// Builds and appends a change on `table` with the given token.
    pub fn push_change(
        &self,
        table: &str,
        operation: Operation,
        token: u64,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> FlowResult<ChangeEvent> {
        let image = |value: Option<serde_json::Value>| -> FlowResult<Option<RowImage>> {
            match value {
                None => Ok(None),
                Some(serde_json::Value::Object(map)) => Ok(Some(map)),
                Some(other) => Err(flow_error!(
                    ErrorKind::InvalidData,
                    "Row images must be JSON objects",
                    other
                )),
            }
        };

        let event = ChangeEvent {
            source_id: self.source_id.clone(),
            table: table.to_string(),
            operation,
            before: image(before)?,
            after: image(after)?,
            sequence_token: SequenceToken::new(token),
            captured_at: Utc::now(),
        };
        self.push(event.clone())?;

        Ok(event)
    }

    /// Makes the next `count` calls to `read_since` fail with `kind`.
    pub fn fail_next_reads(&self, count: usize, kind: ErrorKind) -> FlowResult<()> {
        let mut inner = self.lock()?;
        inner.read_failures.extend(std::iter::repeat_n(kind, count));

        Ok(())
    }

    /// Makes the currently open stream yield an error with `kind` once it caught up.
    pub fn fail_open_stream(&self, kind: ErrorKind) -> FlowResult<()> {
        self.lock()?.stream_failures.push_back(kind);
        self.appended.send_modify(|count| *count += 1);

        Ok(())
    }

    fn read_failure(kind: ErrorKind) -> FlowError {
        flow_error!(kind, "Memory source read failed")
    }

    fn next_after(&self, after: Option<SequenceToken>) -> FlowResult<Next> {
        let mut inner = self.lock()?;

        let event = inner
            .events
            .iter()
            .find(|event| after.is_none_or(|after| event.sequence_token > after))
            .cloned();
        if let Some(event) = event {
            return Ok(Next::Event(event));
        }

        Ok(match inner.stream_failures.pop_front() {
            Some(kind) => Next::Failure(kind),
            None => Next::Wait,
        })
    }
}

struct StreamState {
    source: MemoryChangeSource,
    after: Option<SequenceToken>,
    appended: watch::Receiver<u64>,
    failed: bool,
}

enum Next {
    Event(ChangeEvent),
    Failure(ErrorKind),
    Wait,
}

impl ChangeSource for MemoryChangeSource {
    fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    async fn read_since(&self, after: Option<SequenceToken>) -> FlowResult<ChangeEventStream> {
        if let Some(kind) = self.lock()?.read_failures.pop_front() {
            return Err(Self::read_failure(kind));
        }

        let state = StreamState {
            source: self.clone(),
            after,
            appended: self.appended.subscribe(),
            failed: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }

            loop {
                state.appended.borrow_and_update();

                let next = match state.source.next_after(state.after) {
                    Ok(next) => next,
                    Err(err) => {
                        state.failed = true;
                        return Some((Err(err), state));
                    }
                };

                match next {
                    Next::Event(event) => {
                        state.after = Some(event.sequence_token);
                        return Some((Ok(event), state));
                    }
                    Next::Failure(kind) => {
                        state.failed = true;
                        return Some((Err(MemoryChangeSource::read_failure(kind)), state));
                    }
                    Next::Wait => {
                        if state.appended.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn latest_token(&self) -> FlowResult<Option<SequenceToken>> {
        Ok(self.lock()?.events.last().map(|event| event.sequence_token))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn source() -> MemoryChangeSource {
        MemoryChangeSource::new(SourceId::new("shop-db"))
    }

    #[tokio::test]
    async fn streams_events_after_the_given_token() {
        let source = source();
        for token in [3, 5, 9] {
            source
                .push_change("orders", Operation::Insert, token, None, Some(json!({ "id": token })))
                .unwrap();
        }

        let mut stream = source.read_since(Some(SequenceToken::new(3))).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.sequence_token, SequenceToken::new(5));
        assert_eq!(second.sequence_token, SequenceToken::new(9));
    }

    #[tokio::test]
    async fn open_streams_observe_new_events() {
        let source = source();
        let mut stream = source.read_since(None).await.unwrap();

        let pusher = source.clone();
        tokio::spawn(async move {
            pusher
                .push_change("orders", Operation::Insert, 1, None, Some(json!({ "id": 1 })))
                .unwrap();
        });

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.sequence_token, SequenceToken::new(1));
    }

    #[tokio::test]
    async fn rejects_regressing_tokens() {
        let source = source();
        source
            .push_change("orders", Operation::Insert, 10, None, Some(json!({})))
            .unwrap();

        let err = source
            .push_change("orders", Operation::Insert, 10, None, Some(json!({})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceSequenceRegression);
    }

    #[tokio::test]
    async fn scripted_read_failures_are_returned_in_order() {
        let source = source();
        source
            .fail_next_reads(1, ErrorKind::SourceConnectionFailed)
            .unwrap();

        assert!(source.read_since(None).await.is_err());
        assert!(source.read_since(None).await.is_ok());
    }
}
