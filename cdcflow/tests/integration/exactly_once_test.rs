use cdcflow::delivery::memory::ScriptedResponse;
use cdcflow::store::OutboxStore;
use cdcflow::test_utils::pipeline::TestEnvironment;
use cdcflow::test_utils::wait::wait_for;
use cdcflow::test_utils::workflow::WorkflowBuilder;
use cdcflow::types::{DeadLetterStage, DeliveryStatus, SequenceToken, WorkflowId};
use cdcflow_telemetry::tracing::init_test_tracing;

const LEDGER_URL: &str = "https://ledger.example.com/entries";

// Outbox retries are scheduled on the wall clock, so these tests run in real time.
#[tokio::test]
async fn exactly_once_changes_go_through_the_outbox() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("ledger", LEDGER_URL)
            .exactly_once()
            .build(),
    ])
    .unwrap();
    env.endpoint
        .script(LEDGER_URL, [ScriptedResponse::Status(500)])
        .await;
    let pipeline = env.start_pipeline().await.unwrap();
    let ledger = WorkflowId::new("ledger");

    env.insert("orders", 1, 1).unwrap();
    env.insert("orders", 2, 2).unwrap();

    let env_ref = &env;
    wait_for("both changes delivered by the relay", || async move {
        env_ref.endpoint.applied(LEDGER_URL).await.len() == 2
    })
    .await;

    // Enqueueing is what finishes a change for an exactly-once workflow.
    assert_eq!(
        env.workflow_checkpoint("ledger").await.unwrap(),
        Some(SequenceToken::new(2))
    );

    let ledger_ref = &ledger;
    wait_for("outbox records marked delivered", || async move {
        env_ref
            .store
            .list_outbox_records(ledger_ref)
            .await
            .unwrap()
            .iter()
            .all(|record| record.task.status == DeliveryStatus::Delivered)
    })
    .await;

    let records = env.store.list_outbox_records(&ledger).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].task.sequence_token, SequenceToken::new(1));
    assert_eq!(records[0].task.attempt_count, 2);
    assert_eq!(records[1].task.attempt_count, 1);
    assert_eq!(env.endpoint.duplicates(LEDGER_URL).await, 0);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test]
async fn exhausted_outbox_record_is_dead_lettered_and_requeued_on_replay() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("ledger", LEDGER_URL)
            .exactly_once()
            .build(),
    ])
    .unwrap();
    env.endpoint
        .respond_always(LEDGER_URL, ScriptedResponse::Status(503))
        .await;
    let pipeline = env.start_pipeline().await.unwrap();
    let ledger = WorkflowId::new("ledger");

    env.insert("orders", 1, 1).unwrap();

    let pipeline_ref = &pipeline;
    let ledger_ref = &ledger;
    wait_for("record dead lettered by the relay", || async move {
        pipeline_ref
            .dead_letters()
            .list(Some(ledger_ref))
            .await
            .unwrap()
            .len()
            == 1
    })
    .await;

    let entry = pipeline.dead_letters().list(Some(&ledger)).await.unwrap()[0].clone();
    assert_eq!(entry.stage, DeadLetterStage::OutboxRelay);
    assert_eq!(entry.attempts, 3);
    assert_eq!(env.endpoint.calls_to(LEDGER_URL).await.len(), 3);

    env.endpoint.recover(LEDGER_URL).await;
    pipeline.replay_dead_letter(entry.id).await.unwrap();

    let env_ref = &env;
    wait_for("requeued record delivered", || async move {
        env_ref.endpoint.applied(LEDGER_URL).await.len() == 1
    })
    .await;

    let records = env.store.list_outbox_records(&ledger).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task.attempt_count, 1);

    pipeline.shutdown_and_wait().await.unwrap();
}
