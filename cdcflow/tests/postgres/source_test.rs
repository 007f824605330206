use std::time::Duration;

use cdcflow::source::postgres::PgChangeLogSource;
use cdcflow::source::{ChangeEventStream, ChangeSource};
use cdcflow::test_utils::database::TestDatabase;
use cdcflow::types::{ChangeEvent, Operation, SequenceToken, SourceId};
use cdcflow_telemetry::tracing::init_test_tracing;
use futures::StreamExt;
use sqlx::{Connection, PgConnection};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn change_source(database: &TestDatabase) -> PgChangeLogSource {
    PgChangeLogSource::with_pool(
        SourceId::new("shop-db"),
        database.pool.clone(),
        POLL_INTERVAL,
        100,
    )
}

async fn next_events(stream: &mut ChangeEventStream, count: usize) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for _ in 0..count {
        let event = tokio::time::timeout(EVENT_TIMEOUT, stream.next())
            .await
            .expect("timed out waiting for a change")
            .unwrap()
            .unwrap();
        events.push(event);
    }
    events
}

async fn execute(database: &TestDatabase, statement: &str) {
    sqlx::query(statement).execute(&database.pool).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_captured_changes_in_order() {
    init_test_tracing();
    let Some(database) = TestDatabase::spawn().await else {
        return;
    };
    database.create_captured_table("orders").await;
    let source = change_source(&database);
    assert_eq!(source.latest_token().await.unwrap(), None);

    execute(&database, "insert into public.orders values (1, 'first')").await;
    execute(&database, "insert into public.orders values (2, 'second')").await;
    execute(&database, "update public.orders set note = 'changed' where id = 1").await;
    execute(&database, "delete from public.orders where id = 2").await;

    let mut stream = source.read_since(None).await.unwrap();
    let events = next_events(&mut stream, 4).await;

    let operations: Vec<_> = events.iter().map(|event| event.operation).collect();
    assert_eq!(
        operations,
        vec![Operation::Insert, Operation::Insert, Operation::Update, Operation::Delete]
    );
    assert!(events.windows(2).all(|pair| pair[0].sequence_token < pair[1].sequence_token));
    assert!(events.iter().all(|event| event.table == "orders"));
    assert_eq!(events[2].before.as_ref().unwrap()["note"], "first");
    assert_eq!(events[2].after.as_ref().unwrap()["note"], "changed");
    assert!(events[3].after.is_none());

    assert_eq!(
        source.latest_token().await.unwrap(),
        Some(events[3].sequence_token)
    );

    // Reading again after a token yields the same later changes.
    let mut resumed = source
        .read_since(Some(events[1].sequence_token))
        .await
        .unwrap();
    let again = next_events(&mut resumed, 2).await;
    assert_eq!(again, events[2..].to_vec());

    drop(stream);
    drop(resumed);
    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lower_id_committing_late_is_not_skipped() {
    init_test_tracing();
    let Some(database) = TestDatabase::spawn().await else {
        return;
    };
    database.create_captured_table("orders").await;
    let source = change_source(&database);

    // Takes the first change log id and stays open.
    let mut connection = PgConnection::connect_with(&database.config.connect_options())
        .await
        .unwrap();
    let mut open = connection.begin().await.unwrap();
    sqlx::query("insert into public.orders values (1, 'slow')")
        .execute(&mut *open)
        .await
        .unwrap();

    execute(&database, "insert into public.orders values (2, 'fast')").await;

    let mut stream = source.read_since(None).await.unwrap();
    assert!(
        tokio::time::timeout(POLL_INTERVAL * 15, stream.next())
            .await
            .is_err(),
        "the committed change must wait for the open transaction"
    );

    open.commit().await.unwrap();

    let events = next_events(&mut stream, 2).await;
    let ids: Vec<_> = events
        .iter()
        .map(|event| event.after.as_ref().unwrap()["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(events[0].sequence_token < events[1].sequence_token);
    assert_eq!(events[0].sequence_token, SequenceToken::new(1));

    drop(stream);
    connection.close().await.unwrap();
    database.drop_database().await;
}
