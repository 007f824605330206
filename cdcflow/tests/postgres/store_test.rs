use std::sync::Arc;

use cdcflow::error::ErrorKind;
use cdcflow::store::postgres::PostgresStore;
use cdcflow::store::{CheckpointStore, DeadLetterStore, OutboxStore};
use cdcflow::test_utils::database::TestDatabase;
use cdcflow::types::{
    ChangeEvent, Checkpoint, CheckpointScope, DeadLetterEntry, DeadLetterId, DeadLetterPayload,
    DeadLetterStage, DeliveryStatus, DeliveryTask, IdempotencyKey, Operation, OutboxRecord,
    SequenceToken, SourceId, WorkflowId,
};
use cdcflow_telemetry::tracing::init_test_tracing;
use chrono::Utc;
use serde_json::json;

fn source() -> SourceId {
    SourceId::new("shop-db")
}

fn workflow() -> WorkflowId {
    WorkflowId::new("orders-to-crm")
}

fn workflow_scope() -> CheckpointScope {
    CheckpointScope::Workflow(workflow())
}

fn record(token: u64) -> OutboxRecord {
    let event = ChangeEvent {
        source_id: source(),
        table: "orders".to_string(),
        operation: Operation::Insert,
        before: None,
        after: json!({ "order_id": token }).as_object().cloned(),
        sequence_token: SequenceToken::new(token),
        captured_at: Utc::now(),
    };
    let key = IdempotencyKey::derive(&event, &["order_id".to_string()]).unwrap();
    let task = DeliveryTask::new(key, workflow(), &event, json!({ "id": token }));
    let checkpoint = Checkpoint::workflow(source(), workflow(), event.sequence_token);

    OutboxRecord::new(task, checkpoint)
}

async fn stored_token(store: &PostgresStore, scope: &CheckpointScope) -> Option<SequenceToken> {
    store
        .get_checkpoint(&source(), scope)
        .await
        .unwrap()
        .map(|checkpoint| checkpoint.sequence_token)
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_upsert_never_moves_backwards() {
    init_test_tracing();
    let Some(database) = TestDatabase::spawn().await else {
        return;
    };
    let store = PostgresStore::with_pool(database.pool.clone());

    assert!(
        store
            .advance_checkpoint(Checkpoint::source(source(), SequenceToken::new(10)))
            .await
            .unwrap()
    );
    assert!(
        !store
            .advance_checkpoint(Checkpoint::source(source(), SequenceToken::new(7)))
            .await
            .unwrap()
    );
    assert!(
        !store
            .advance_checkpoint(Checkpoint::source(source(), SequenceToken::new(10)))
            .await
            .unwrap()
    );
    store
        .advance_checkpoint(Checkpoint::workflow(source(), workflow(), SequenceToken::new(4)))
        .await
        .unwrap();

    assert_eq!(
        stored_token(&store, &CheckpointScope::Source).await,
        Some(SequenceToken::new(10))
    );
    let scopes: Vec<_> = store
        .get_checkpoints(&source())
        .await
        .unwrap()
        .into_iter()
        .map(|checkpoint| checkpoint.scope)
        .collect();
    assert_eq!(scopes, vec![CheckpointScope::Source, workflow_scope()]);

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_checkpoint_writers_keep_the_highest_token() {
    init_test_tracing();
    let Some(database) = TestDatabase::spawn().await else {
        return;
    };
    let store = Arc::new(PostgresStore::with_pool(database.pool.clone()));

    let writers: Vec<_> = [5u64, 40, 12, 33, 1, 27, 39, 8]
        .into_iter()
        .map(|token| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .advance_checkpoint(Checkpoint::source(source(), SequenceToken::new(token)))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    assert_eq!(
        stored_token(&store, &CheckpointScope::Source).await,
        Some(SequenceToken::new(40))
    );

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn outbox_insert_commits_record_and_checkpoint_together() {
    init_test_tracing();
    let Some(database) = TestDatabase::spawn().await else {
        return;
    };
    let store = PostgresStore::with_pool(database.pool.clone());

    assert!(store.insert_outbox_record(record(5)).await.unwrap());
    assert_eq!(
        stored_token(&store, &workflow_scope()).await,
        Some(SequenceToken::new(5))
    );

    // Same key again: no second record, the checkpoint write is still guarded.
    assert!(!store.insert_outbox_record(record(5)).await.unwrap());
    assert!(store.insert_outbox_record(record(3)).await.unwrap());
    assert_eq!(
        stored_token(&store, &workflow_scope()).await,
        Some(SequenceToken::new(5))
    );

    let records = store.list_outbox_records(&workflow()).await.unwrap();
    assert_eq!(records.len(), 2);
    let stored = store
        .get_outbox_record(&workflow(), &record(5).task.idempotency_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.task.payload, json!({ "id": 5 }));
    assert_eq!(stored.task.status, DeliveryStatus::Pending);
    assert_eq!(
        stored.written_in_transaction_with.sequence_token,
        SequenceToken::new(5)
    );

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn outbox_insert_rolls_back_with_a_failing_checkpoint() {
    init_test_tracing();
    let Some(database) = TestDatabase::spawn().await else {
        return;
    };
    let store = PostgresStore::with_pool(database.pool.clone());
    sqlx::query(
        "alter table cdcflow.checkpoints add constraint tokens_below_100 \
         check (sequence_token < 100)",
    )
    .execute(&database.pool)
    .await
    .unwrap();

    let err = store.insert_outbox_record(record(100)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StateStoreQueryFailed);
    assert!(store.list_outbox_records(&workflow()).await.unwrap().is_empty());
    assert_eq!(stored_token(&store, &workflow_scope()).await, None);

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_returns_due_records_oldest_first() {
    init_test_tracing();
    let Some(database) = TestDatabase::spawn().await else {
        return;
    };
    let store = PostgresStore::with_pool(database.pool.clone());
    for token in 1..=3 {
        store.insert_outbox_record(record(token)).await.unwrap();
    }

    let mut delivered = store.list_outbox_records(&workflow()).await.unwrap()[0].clone();
    delivered.task.status = DeliveryStatus::Delivered;
    store.update_outbox_record(&delivered).await.unwrap();

    let mut later = store.list_outbox_records(&workflow()).await.unwrap()[1].clone();
    later.task.status = DeliveryStatus::Retrying;
    later.task.attempt_count = 1;
    later.next_attempt_at = Utc::now() + chrono::Duration::minutes(5);
    later.last_error = Some("endpoint unavailable".to_string());
    store.update_outbox_record(&later).await.unwrap();

    let due = store
        .poll_due_outbox_records(&workflow(), Utc::now(), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].task.sequence_token, SequenceToken::new(3));

    let stored = store
        .get_outbox_record(&workflow(), &later.task.idempotency_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.task.attempt_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("endpoint unavailable"));

    let mut missing = record(9);
    missing.task.status = DeliveryStatus::Delivered;
    assert_eq!(
        store.update_outbox_record(&missing).await.unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_letters_are_kept_across_replays() {
    init_test_tracing();
    let Some(database) = TestDatabase::spawn().await else {
        return;
    };
    let store = PostgresStore::with_pool(database.pool.clone());
    let entry = DeadLetterEntry::new(
        workflow(),
        DeadLetterStage::Delivery,
        "endpoint rejected".to_string(),
        3,
        DeadLetterPayload::Task(record(1).task),
    );
    let id = entry.id;
    store.insert_dead_letter(entry.clone()).await.unwrap();

    let replayed = store.record_dead_letter_replay(id, Utc::now()).await.unwrap();
    assert_eq!(replayed.replay_count, 1);
    assert!(replayed.last_replayed_at.is_some());
    assert_eq!(replayed.payload, entry.payload);

    assert_eq!(store.list_dead_letters(Some(&workflow())).await.unwrap().len(), 1);
    assert!(
        store
            .list_dead_letters(Some(&WorkflowId::new("audit")))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        store
            .record_dead_letter_replay(DeadLetterId::new(), Utc::now())
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::DeadLetterNotFound
    );

    database.drop_database().await;
}
