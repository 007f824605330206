use std::time::Duration;

use cdcflow_config::shared::PgConnectionConfig;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::debug;

use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::store::{CheckpointStore, DeadLetterStore, OutboxStore};
use crate::types::{
    Checkpoint, CheckpointScope, DeadLetterEntry, DeadLetterId, DeadLetterPayload,
    DeliveryTask, IdempotencyKey, OutboxRecord, SequenceToken, SourceId, WorkflowId,
};

/// Idle connections are closed after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates a lazily connected pool; connections are opened on first use.
fn create_database_pool(config: &PgConnectionConfig) -> PgPool {
    PgPoolOptions::new()
        .min_connections(0)
        .max_connections(config.max_connections)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .connect_lazy_with(config.connect_options())
}

fn encode_scope(scope: &CheckpointScope) -> String {
    scope.to_string()
}

fn decode_scope(scope: &str) -> FlowResult<CheckpointScope> {
    if scope == "source" {
        return Ok(CheckpointScope::Source);
    }

    scope
        .strip_prefix("workflow:")
        .map(|workflow_id| CheckpointScope::Workflow(WorkflowId::new(workflow_id)))
        .ok_or_else(|| {
            flow_error!(
                ErrorKind::InvalidData,
                "Unknown checkpoint scope",
                format!("scope `{scope}`")
            )
        })
}

async fn upsert_checkpoint<'c, E>(executor: E, checkpoint: &Checkpoint) -> FlowResult<bool>
where
    E: PgExecutor<'c>,
{
    let result = sqlx::query(
        r#"
        insert into cdcflow.checkpoints (source_id, scope, sequence_token, updated_at)
        values ($1, $2, $3, $4)
        on conflict (source_id, scope) do update
        set sequence_token = excluded.sequence_token, updated_at = excluded.updated_at
        where cdcflow.checkpoints.sequence_token < excluded.sequence_token
        "#,
    )
    .bind(checkpoint.source_id.as_str())
    .bind(encode_scope(&checkpoint.scope))
    .bind(i64::try_from(checkpoint.sequence_token)?)
    .bind(checkpoint.updated_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

fn checkpoint_from_row(row: &PgRow) -> FlowResult<Checkpoint> {
    Ok(Checkpoint {
        source_id: SourceId::new(row.try_get::<String, _>("source_id")?),
        scope: decode_scope(&row.try_get::<String, _>("scope")?)?,
        sequence_token: SequenceToken::try_from(row.try_get::<i64, _>("sequence_token")?)?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn outbox_record_from_row(row: &PgRow) -> FlowResult<OutboxRecord> {
    let workflow_id = WorkflowId::new(row.try_get::<String, _>("workflow_id")?);
    let source_id = SourceId::new(row.try_get::<String, _>("source_id")?);
    let status: String = row.try_get("status")?;

    let task = DeliveryTask {
        idempotency_key: IdempotencyKey::from(row.try_get::<String, _>("idempotency_key")?),
        workflow_id: workflow_id.clone(),
        source_id: source_id.clone(),
        sequence_token: SequenceToken::try_from(row.try_get::<i64, _>("sequence_token")?)?,
        payload: row.try_get::<Json<serde_json::Value>, _>("payload")?.0,
        attempt_count: u32::try_from(row.try_get::<i32, _>("attempt_count")?)?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
    };

    Ok(OutboxRecord {
        task,
        written_in_transaction_with: Checkpoint {
            source_id,
            scope: CheckpointScope::Workflow(workflow_id),
            sequence_token: SequenceToken::try_from(row.try_get::<i64, _>("checkpoint_token")?)?,
            updated_at: row.try_get("checkpoint_updated_at")?,
        },
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> FlowResult<DeadLetterEntry> {
    Ok(DeadLetterEntry {
        id: DeadLetterId::from(row.try_get::<uuid::Uuid, _>("id")?),
        workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
        stage: row.try_get::<String, _>("stage")?.parse()?,
        reason: row.try_get("reason")?,
        attempts: u32::try_from(row.try_get::<i32, _>("attempts")?)?,
        payload: row.try_get::<Json<DeadLetterPayload>, _>("payload")?.0,
        created_at: row.try_get("created_at")?,
        replay_count: u32::try_from(row.try_get::<i32, _>("replay_count")?)?,
        last_replayed_at: row.try_get("last_replayed_at")?,
    })
}

const OUTBOX_COLUMNS: &str = "workflow_id, idempotency_key, source_id, sequence_token, payload, \
    attempt_count, status, created_at, next_attempt_at, last_error, checkpoint_token, \
    checkpoint_updated_at";

const DEAD_LETTER_COLUMNS: &str = "id, workflow_id, stage, reason, attempts, payload, created_at, \
    replay_count, last_replayed_at";

/// Postgres implementation of every store trait, backed by the `cdcflow` schema.
///
/// Run [`crate::migrations::apply_migrations`] before using it. Guarded upserts keep
/// checkpoints monotonic even with concurrent writers.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(config: &PgConnectionConfig) -> Self {
        Self {
            pool: create_database_pool(config),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for PostgresStore {
    async fn get_checkpoint(
        &self,
        source_id: &SourceId,
        scope: &CheckpointScope,
    ) -> FlowResult<Option<Checkpoint>> {
        let row = sqlx::query(
            "select source_id, scope, sequence_token, updated_at from cdcflow.checkpoints \
             where source_id = $1 and scope = $2",
        )
        .bind(source_id.as_str())
        .bind(encode_scope(scope))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn get_checkpoints(&self, source_id: &SourceId) -> FlowResult<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "select source_id, scope, sequence_token, updated_at from cdcflow.checkpoints \
             where source_id = $1 order by scope",
        )
        .bind(source_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn advance_checkpoint(&self, checkpoint: Checkpoint) -> FlowResult<bool> {
        let advanced = upsert_checkpoint(&self.pool, &checkpoint).await?;
        if !advanced {
            debug!(
                source_id = %checkpoint.source_id,
                scope = %checkpoint.scope,
                sequence_token = %checkpoint.sequence_token,
                "ignored stale checkpoint"
            );
        }

        Ok(advanced)
    }
}

impl OutboxStore for PostgresStore {
    async fn insert_outbox_record(&self, record: OutboxRecord) -> FlowResult<bool> {
        let mut tx = self.pool.begin().await?;

        let task = &record.task;
        let checkpoint = &record.written_in_transaction_with;
        let inserted = sqlx::query(&format!(
            "insert into cdcflow.outbox ({OUTBOX_COLUMNS}) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             on conflict (workflow_id, idempotency_key) do nothing"
        ))
        .bind(task.workflow_id.as_str())
        .bind(task.idempotency_key.as_str())
        .bind(task.source_id.as_str())
        .bind(i64::try_from(task.sequence_token)?)
        .bind(Json(&task.payload))
        .bind(i32::try_from(task.attempt_count)?)
        .bind(task.status.as_str())
        .bind(task.created_at)
        .bind(record.next_attempt_at)
        .bind(record.last_error.as_deref())
        .bind(i64::try_from(checkpoint.sequence_token)?)
        .bind(checkpoint.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        upsert_checkpoint(&mut *tx, checkpoint).await?;

        tx.commit().await?;

        Ok(inserted)
    }

    async fn get_outbox_record(
        &self,
        workflow_id: &WorkflowId,
        idempotency_key: &IdempotencyKey,
    ) -> FlowResult<Option<OutboxRecord>> {
        let row = sqlx::query(&format!(
            "select {OUTBOX_COLUMNS} from cdcflow.outbox \
             where workflow_id = $1 and idempotency_key = $2"
        ))
        .bind(workflow_id.as_str())
        .bind(idempotency_key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(outbox_record_from_row).transpose()
    }

    async fn poll_due_outbox_records(
        &self,
        workflow_id: &WorkflowId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> FlowResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "select {OUTBOX_COLUMNS} from cdcflow.outbox \
             where workflow_id = $1 \
               and status in ('pending', 'retrying', 'in_flight') \
               and next_attempt_at <= $2 \
             order by created_at, sequence_token \
             limit $3"
        ))
        .bind(workflow_id.as_str())
        .bind(now)
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(outbox_record_from_row).collect()
    }

    async fn update_outbox_record(&self, record: &OutboxRecord) -> FlowResult<()> {
        let result = sqlx::query(
            "update cdcflow.outbox \
             set status = $3, attempt_count = $4, next_attempt_at = $5, last_error = $6 \
             where workflow_id = $1 and idempotency_key = $2",
        )
        .bind(record.task.workflow_id.as_str())
        .bind(record.task.idempotency_key.as_str())
        .bind(record.task.status.as_str())
        .bind(i32::try_from(record.task.attempt_count)?)
        .bind(record.next_attempt_at)
        .bind(record.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(flow_error!(
                ErrorKind::InvalidState,
                "Outbox record does not exist",
                format!(
                    "workflow {} key {}",
                    record.task.workflow_id, record.task.idempotency_key
                )
            ));
        }

        Ok(())
    }

    async fn list_outbox_records(&self, workflow_id: &WorkflowId) -> FlowResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "select {OUTBOX_COLUMNS} from cdcflow.outbox where workflow_id = $1 \
             order by created_at, sequence_token"
        ))
        .bind(workflow_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(outbox_record_from_row).collect()
    }
}

impl DeadLetterStore for PostgresStore {
    async fn insert_dead_letter(&self, entry: DeadLetterEntry) -> FlowResult<()> {
        sqlx::query(&format!(
            "insert into cdcflow.dead_letters ({DEAD_LETTER_COLUMNS}) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(entry.id.as_uuid())
        .bind(entry.workflow_id.as_str())
        .bind(entry.stage.as_str())
        .bind(&entry.reason)
        .bind(i32::try_from(entry.attempts)?)
        .bind(Json(&entry.payload))
        .bind(entry.created_at)
        .bind(i32::try_from(entry.replay_count)?)
        .bind(entry.last_replayed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> FlowResult<Option<DeadLetterEntry>> {
        let row = sqlx::query(&format!(
            "select {DEAD_LETTER_COLUMNS} from cdcflow.dead_letters where id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn list_dead_letters(
        &self,
        workflow_id: Option<&WorkflowId>,
    ) -> FlowResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(&format!(
            "select {DEAD_LETTER_COLUMNS} from cdcflow.dead_letters \
             where $1::text is null or workflow_id = $1 \
             order by created_at, id"
        ))
        .bind(workflow_id.map(|id| id.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn record_dead_letter_replay(
        &self,
        id: DeadLetterId,
        replayed_at: DateTime<Utc>,
    ) -> FlowResult<DeadLetterEntry> {
        let row = sqlx::query(&format!(
            "update cdcflow.dead_letters \
             set replay_count = replay_count + 1, last_replayed_at = $2 \
             where id = $1 \
             returning {DEAD_LETTER_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(replayed_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => dead_letter_from_row(&row),
            None => Err(flow_error!(
                ErrorKind::DeadLetterNotFound,
                "Dead letter entry does not exist",
                id
            )),
        }
    }
}
