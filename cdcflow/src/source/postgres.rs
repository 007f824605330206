use std::collections::VecDeque;
use std::time::Duration;

use cdcflow_config::shared::ChangeLogSourceConfig;
use futures::StreamExt;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::trace;

use crate::error::{FlowError, FlowResult};
use crate::source::{ChangeEventStream, ChangeSource};
use crate::types::{ChangeEvent, RowImage, SequenceToken, SourceId};

/// Allocation samples kept while a long running transaction holds the horizon back.
const MAX_PENDING_SAMPLES: usize = 64;

/// Ids handed out by the change log sequence at some point, and the first transaction id not
/// yet assigned right after.
///
/// Every id up to `last_id` was allocated by a transaction whose id is below `next_xid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AllocationSample {
    last_id: i64,
    next_xid: i64,
}

/// Highest change log id below which no row can appear anymore.
///
/// Ids are allocated when a row is written but become visible when its transaction commits,
/// so a lower id can show up after a higher one was read. An id is readable once every
/// transaction that could have allocated an id up to it finished, which is known when the
/// oldest running transaction is past the `next_xid` of a sample taken after the allocation.
#[derive(Debug, Default)]
struct CommitHorizon {
    pending: VecDeque<AllocationSample>,
    readable_until: i64,
}

impl CommitHorizon {
    fn record(&mut self, sample: AllocationSample) {
        if self.pending.len() >= MAX_PENDING_SAMPLES {
            // The newer sample releases everything the dropped one would have, only later.
            self.pending.pop_back();
        }
        self.pending.push_back(sample);
    }

    /// Releases the samples whose transactions all finished and returns the readable bound.
    fn advance(&mut self, oldest_running_xid: i64) -> i64 {
        while let Some(sample) = self.pending.front() {
            if sample.next_xid > oldest_running_xid {
                break;
            }
            self.readable_until = self.readable_until.max(sample.last_id);
            self.pending.pop_front();
        }

        self.readable_until
    }
}

/// Reads changes recorded by the `cdcflow.capture_change()` trigger.
///
/// The `id` column of `cdcflow.change_log` is used as sequence token. A row is only read
/// once no transaction that could still commit a lower id is running, so rows committing
/// out of id order are never skipped. A long running transaction of the database delays
/// capture until it finishes. Streams poll the table, sleeping for the configured interval
/// whenever they caught up.
#[derive(Debug, Clone)]
pub struct PgChangeLogSource {
    source_id: SourceId,
    pool: PgPool,
    poll_interval: Duration,
    fetch_size: i64,
}

impl PgChangeLogSource {
    pub fn new(source_id: SourceId, config: &ChangeLogSourceConfig) -> Self {
        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(config.connection.max_connections)
            .connect_lazy_with(config.connection.connect_options());

        Self::with_pool(source_id, pool, config.poll_interval(), config.fetch_size)
    }

    pub fn with_pool(
        source_id: SourceId,
        pool: PgPool,
        poll_interval: Duration,
        fetch_size: i64,
    ) -> Self {
        Self {
            source_id,
            pool,
            poll_interval,
            fetch_size,
        }
    }

    /// Samples the change log sequence, then the transaction ids, in two statements so the
    /// second snapshot is taken after the ids were read.
    async fn sample_allocation(&self) -> FlowResult<(AllocationSample, i64)> {
        let last_id: i64 = sqlx::query_scalar(
            "select case when is_called then last_value else 0 end \
             from cdcflow.change_log_id_seq",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|err| FlowError::from(err).into_source_error())?;

        let row = sqlx::query(
            "select pg_snapshot_xmin(snapshot)::text::bigint as oldest_running_xid, \
             pg_snapshot_xmax(snapshot)::text::bigint as next_xid \
             from pg_current_snapshot() as snapshot",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|err| FlowError::from(err).into_source_error())?;

        let read = |err: sqlx::Error| FlowError::from(err).into_source_error();
        let sample = AllocationSample {
            last_id,
            next_xid: row.try_get("next_xid").map_err(read)?,
        };

        Ok((sample, row.try_get("oldest_running_xid").map_err(read)?))
    }

    async fn fetch_between(
        &self,
        after: Option<SequenceToken>,
        until: i64,
    ) -> FlowResult<Vec<ChangeEvent>> {
        let after = match after {
            Some(token) => i64::try_from(token)?,
            None => 0,
        };
        if after >= until {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "select id, table_name, operation, before, after, captured_at \
             from cdcflow.change_log where id > $1 and id <= $2 order by id limit $3",
        )
        .bind(after)
        .bind(until)
        .bind(self.fetch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| FlowError::from(err).into_source_error())?;

        rows.iter().map(|row| self.event_from_row(row)).collect()
    }

    fn event_from_row(&self, row: &PgRow) -> FlowResult<ChangeEvent> {
        let read = |err: sqlx::Error| FlowError::from(err).into_source_error();

        Ok(ChangeEvent {
            source_id: self.source_id.clone(),
            table: row.try_get("table_name").map_err(read)?,
            operation: row.try_get::<String, _>("operation").map_err(read)?.parse()?,
            before: row
                .try_get::<Option<Json<RowImage>>, _>("before")
                .map_err(read)?
                .map(|image| image.0),
            after: row
                .try_get::<Option<Json<RowImage>>, _>("after")
                .map_err(read)?
                .map(|image| image.0),
            sequence_token: SequenceToken::try_from(row.try_get::<i64, _>("id").map_err(read)?)?,
            captured_at: row.try_get("captured_at").map_err(read)?,
        })
    }
}

struct PollState {
    source: PgChangeLogSource,
    after: Option<SequenceToken>,
    horizon: CommitHorizon,
    buffered: VecDeque<ChangeEvent>,
    failed: bool,
}

impl PollState {
    /// Fetches the next readable changes, if any.
    async fn poll(&mut self) -> FlowResult<()> {
        let (sample, oldest_running_xid) = self.source.sample_allocation().await?;
        self.horizon.record(sample);
        let until = self.horizon.advance(oldest_running_xid);

        let events = self.source.fetch_between(self.after, until).await?;
        if let Some(last) = events.last() {
            trace!(
                source_id = %self.source.source_id,
                until = %last.sequence_token,
                "fetched changes"
            );
        }
        self.buffered.extend(events);

        Ok(())
    }
}

impl ChangeSource for PgChangeLogSource {
    fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    async fn read_since(&self, after: Option<SequenceToken>) -> FlowResult<ChangeEventStream> {
        let mut state = PollState {
            source: self.clone(),
            after,
            horizon: CommitHorizon::default(),
            buffered: VecDeque::new(),
            failed: false,
        };
        // Fail fast on connection problems instead of on the first poll.
        state.poll().await?;

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }

            loop {
                if let Some(event) = state.buffered.pop_front() {
                    state.after = Some(event.sequence_token);
                    return Some((Ok(event), state));
                }

                if let Err(err) = state.poll().await {
                    state.failed = true;
                    return Some((Err(err), state));
                }
                if state.buffered.is_empty() {
                    tokio::time::sleep(state.source.poll_interval).await;
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn latest_token(&self) -> FlowResult<Option<SequenceToken>> {
        let latest: Option<i64> = sqlx::query_scalar("select max(id) from cdcflow.change_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| FlowError::from(err).into_source_error())?;

        latest.map(SequenceToken::try_from).transpose()
    }
}
