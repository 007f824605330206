use cdcflow::error::ErrorKind;
use cdcflow::failpoints::{DELIVERY_BEFORE_CHECKPOINT, OUTBOX_RELAY_AFTER_SEND};
use cdcflow::store::OutboxStore;
use cdcflow::test_utils::failpoints::FailpointScenario;
use cdcflow::test_utils::pipeline::TestEnvironment;
use cdcflow::test_utils::wait::wait_for;
use cdcflow::test_utils::workflow::WorkflowBuilder;
use cdcflow::types::{DeliveryStatus, SequenceToken, WorkflowId};
use cdcflow_telemetry::tracing::init_test_tracing;

const CRM_URL: &str = "https://crm.example.com/hooks/orders";
const LEDGER_URL: &str = "https://ledger.example.com/entries";

#[tokio::test]
async fn relay_crash_after_send_is_deduplicated_by_the_endpoint() {
    init_test_tracing();
    let scenario = FailpointScenario::setup(&[(OUTBOX_RELAY_AFTER_SEND, "return")]);
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("ledger", LEDGER_URL)
            .exactly_once()
            .build(),
    ])
    .unwrap();
    let ledger = WorkflowId::new("ledger");
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 1).unwrap();

    let pipeline_ref = &pipeline;
    let ledger_ref = &ledger;
    wait_for("relay stopped after sending", || async move {
        pipeline_ref
            .health()
            .await
            .get(ledger_ref)
            .is_some_and(|health| health.is_stopped())
    })
    .await;
    assert_eq!(env.endpoint.applied(LEDGER_URL).await.len(), 1);

    let err = pipeline.shutdown_and_wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::WithNoRetry]);

    // The record was sent but never marked delivered, the restarted relay sends it again.
    scenario.turn_off(OUTBOX_RELAY_AFTER_SEND);
    let pipeline = env.start_pipeline().await.unwrap();

    let env_ref = &env;
    wait_for("record marked delivered", || async move {
        env_ref
            .store
            .list_outbox_records(ledger_ref)
            .await
            .unwrap()
            .iter()
            .all(|record| record.task.status == DeliveryStatus::Delivered)
    })
    .await;

    let calls = env.endpoint.calls_to(LEDGER_URL).await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].idempotency_key, calls[1].idempotency_key);
    assert_eq!(env.endpoint.applied(LEDGER_URL).await.len(), 1);
    assert_eq!(env.endpoint.duplicates(LEDGER_URL).await, 1);
    assert_eq!(env.store.list_outbox_records(&ledger).await.unwrap().len(), 1);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn crash_before_checkpoint_redelivers_with_the_same_key() {
    init_test_tracing();
    let scenario = FailpointScenario::setup(&[(DELIVERY_BEFORE_CHECKPOINT, "return")]);
    let env = TestEnvironment::new(vec![WorkflowBuilder::new("crm", CRM_URL).build()]).unwrap();
    let crm = WorkflowId::new("crm");
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 42).unwrap();

    let pipeline_ref = &pipeline;
    let crm_ref = &crm;
    wait_for("lane stopped before its checkpoint", || async move {
        pipeline_ref
            .health()
            .await
            .get(crm_ref)
            .is_some_and(|health| health.is_stopped())
    })
    .await;
    assert_eq!(env.workflow_checkpoint("crm").await.unwrap(), None);
    assert_eq!(env.source_checkpoint().await.unwrap(), None);

    let err = pipeline.shutdown_and_wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::WithNoRetry]);

    scenario.turn_off(DELIVERY_BEFORE_CHECKPOINT);
    let pipeline = env.start_pipeline().await.unwrap();

    let env_ref = &env;
    wait_for("change settled after the restart", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(1))
    })
    .await;

    let calls = env.endpoint.calls_to(CRM_URL).await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].idempotency_key.as_str(), "shop-db:orders:id=42:1");
    assert_eq!(calls[0].idempotency_key, calls[1].idempotency_key);
    assert_eq!(env.endpoint.applied(CRM_URL).await.len(), 1);
    assert_eq!(env.endpoint.duplicates(CRM_URL).await, 1);

    pipeline.shutdown_and_wait().await.unwrap();
}
