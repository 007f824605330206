use cdcflow_config::shared::{CaptureConfig, InitialSnapshotPolicy};
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{info, warn};

use crate::concurrency::backoff::Backoff;
use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::source::{ChangeEventStream, ChangeSource};
use crate::store::CheckpointStore;
use crate::types::{ChangeEvent, CheckpointScope, SequenceToken};
use crate::workers::policy::build_error_handling_policy;

/// Endless stream of captured changes in strictly increasing token order.
///
/// It only yields an `Err` once, when the source is considered failed, and ends after it.
pub type CaptureStream = BoxStream<'static, FlowResult<ChangeEvent>>;

/// Reads a [`ChangeSource`] starting from a checkpoint and reconnects on transient errors.
#[derive(Debug, Clone)]
pub struct ChangeCaptureAdapter<Src, S> {
    source: Src,
    store: S,
    config: CaptureConfig,
}

impl<Src, S> ChangeCaptureAdapter<Src, S>
where
    Src: ChangeSource + Clone + Send + Sync + 'static,
    S: CheckpointStore + Clone + Send + Sync + 'static,
{
    pub fn new(source: Src, store: S, config: CaptureConfig) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    /// Determines where capture resumes: after the stored source checkpoint, or according to
    /// the initial snapshot policy when there is none.
    pub async fn resume_point(&self) -> FlowResult<Option<SequenceToken>> {
        let source_id = self.source.source_id();
        let checkpoint = self
            .store
            .get_checkpoint(source_id, &CheckpointScope::Source)
            .await?;

        if let Some(checkpoint) = checkpoint {
            info!(%source_id, token = %checkpoint.sequence_token, "resuming capture from checkpoint");

            return Ok(Some(checkpoint.sequence_token));
        }

        let from = match self.config.initial_snapshot {
            InitialSnapshotPolicy::Full => None,
            InitialSnapshotPolicy::Latest => self.source.latest_token().await?,
        };
        info!(%source_id, policy = ?self.config.initial_snapshot, from = ?from, "no checkpoint found, starting capture");

        Ok(from)
    }

    /// Starts capturing after the stored checkpoint.
    pub async fn resume(&self) -> FlowResult<CaptureStream> {
        let from = self.resume_point().await?;

        Ok(self.start_capture(from))
    }

    /// Starts capturing every change after `from`, or every retained change for `None`.
    ///
    /// The source is opened lazily by the returned stream. Transient read errors are retried
    /// following the capture retry policy and resume after the last yielded change, so no
    /// change is skipped. Once the policy is exhausted, or on an error that cannot be retried,
    /// the stream yields [`ErrorKind::SourceFatal`] and ends. A token that does not follow the
    /// last yielded one ends the stream with [`ErrorKind::SourceSequenceRegression`].
    pub fn start_capture(&self, from: Option<SequenceToken>) -> CaptureStream {
        let state = CaptureState {
            source: self.source.clone(),
            backoff: Backoff::new(self.config.retry.clone()),
            last_emitted: from,
            stream: None,
            failures: 0,
            finished: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }

            match state.next_event().await {
                Ok(event) => Some((Ok(event), state)),
                Err(err) => {
                    state.finished = true;
                    Some((Err(err), state))
                }
            }
        })
        .boxed()
    }
}

struct CaptureState<Src> {
    source: Src,
    backoff: Backoff,
    last_emitted: Option<SequenceToken>,
    stream: Option<ChangeEventStream>,
    /// Consecutive failures since the source was last opened successfully.
    failures: u32,
    finished: bool,
}

impl<Src> CaptureState<Src>
where
    Src: ChangeSource + Send + Sync,
{
    async fn next_event(&mut self) -> FlowResult<ChangeEvent> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                match self.source.read_since(self.last_emitted).await {
                    Ok(stream) => {
                        self.failures = 0;
                        self.stream = Some(stream);
                    }
                    Err(err) => self.on_failure(err).await?,
                }
                continue;
            };

            match stream.next().await {
                Some(Ok(event)) => {
                    if let Some(last) = self.last_emitted {
                        if event.sequence_token <= last {
                            return Err(flow_error!(
                                ErrorKind::SourceSequenceRegression,
                                "Source returned a regressing sequence token",
                                format!("token {} after {last}", event.sequence_token)
                            ));
                        }
                    }

                    self.last_emitted = Some(event.sequence_token);

                    return Ok(event);
                }
                Some(Err(err)) => {
                    self.stream = None;
                    self.on_failure(err).await?;
                }
                None => {
                    self.stream = None;
                    let err = flow_error!(
                        ErrorKind::SourceConnectionFailed,
                        "Change stream ended unexpectedly"
                    );
                    self.on_failure(err).await?;
                }
            }
        }
    }

    /// Waits before the next reconnection, or escalates the error when it cannot be retried
    /// anymore.
    async fn on_failure(&mut self, err: crate::error::FlowError) -> FlowResult<()> {
        let source_id = self.source.source_id();

        if !build_error_handling_policy(&err).is_retryable() {
            return Err(flow_error!(
                ErrorKind::SourceFatal,
                "Source failed with a non retryable error",
                err.summary(),
                source: err
            ));
        }

        self.failures += 1;
        if !self.backoff.allows_retry(self.failures) {
            return Err(flow_error!(
                ErrorKind::SourceFatal,
                "Source unavailable after every reconnection attempt",
                format!("{} attempts, last error: {}", self.failures, err.summary()),
                source: err
            ));
        }

        let delay = self.backoff.delay_for(self.failures);
        warn!(
            %source_id,
            attempt = self.failures,
            max_attempts = self.backoff.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err.summary(),
            "source read failed, reconnecting"
        );
        tokio::time::sleep(delay).await;

        Ok(())
    }
}
