use std::time::Duration;

use cdcflow::delivery::memory::ScriptedResponse;
use cdcflow::test_utils::pipeline::TestEnvironment;
use cdcflow::test_utils::wait::wait_for;
use cdcflow::test_utils::workflow::{WorkflowBuilder, fast_retry};
use cdcflow::types::{SequenceToken, WorkflowHealth, WorkflowId};
use cdcflow_telemetry::tracing::init_test_tracing;

const CRM_URL: &str = "https://crm.example.com/hooks/orders";
const AUDIT_URL: &str = "https://audit.example.com/ingest";

#[tokio::test(start_paused = true)]
async fn change_fans_out_to_every_subscribed_workflow() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("crm", CRM_URL).tables(&["orders"]).build(),
        WorkflowBuilder::new("audit", AUDIT_URL).build(),
    ])
    .unwrap();
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 42).unwrap();

    let env_ref = &env;
    wait_for("both workflows delivered", || async move {
        env_ref.endpoint.applied(CRM_URL).await.len() == 1
            && env_ref.endpoint.applied(AUDIT_URL).await.len() == 1
    })
    .await;
    wait_for("source checkpoint advanced", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(1))
    })
    .await;

    let crm = env.endpoint.applied(CRM_URL).await;
    let audit = env.endpoint.applied(AUDIT_URL).await;
    assert_eq!(crm[0].0.as_str(), "shop-db:orders:id=42:1");
    assert_eq!(crm[0].0, audit[0].0);
    assert_eq!(crm[0].1["after"]["id"], 42);

    assert_eq!(
        env.workflow_checkpoint("crm").await.unwrap(),
        Some(SequenceToken::new(1))
    );
    assert_eq!(
        env.workflow_checkpoint("audit").await.unwrap(),
        Some(SequenceToken::new(1))
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unrouted_changes_are_dropped_and_checkpointed() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("crm", CRM_URL).tables(&["orders"]).build(),
    ])
    .unwrap();
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("customers", 1, 7).unwrap();

    let env_ref = &env;
    wait_for("source checkpoint passed the unrouted change", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(1))
    })
    .await;

    let source_metrics = pipeline.source_metrics().unwrap().snapshot();
    assert_eq!(source_metrics.events_captured, 1);
    assert_eq!(source_metrics.events_unrouted, 1);
    assert!(env.endpoint.calls().await.is_empty());

    env.insert("orders", 2, 8).unwrap();
    wait_for("routed change delivered", || async move {
        env_ref.endpoint.applied(CRM_URL).await.len() == 1
    })
    .await;

    let crm_metrics = pipeline
        .workflow_metrics(&WorkflowId::new("crm"))
        .await
        .unwrap()
        .snapshot();
    assert_eq!(crm_metrics.events_routed, 1);
    assert_eq!(crm_metrics.delivered, 1);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_endpoint_failures_are_retried_with_the_same_key() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![WorkflowBuilder::new("crm", CRM_URL).build()]).unwrap();
    env.endpoint
        .script(
            CRM_URL,
            [ScriptedResponse::Status(503), ScriptedResponse::Unavailable],
        )
        .await;
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 42).unwrap();

    let env_ref = &env;
    wait_for("change delivered after retries", || async move {
        env_ref.endpoint.applied(CRM_URL).await.len() == 1
    })
    .await;

    let calls = env.endpoint.calls_to(CRM_URL).await;
    assert_eq!(calls.len(), 3);
    assert!(
        calls
            .iter()
            .all(|call| call.idempotency_key == calls[0].idempotency_key)
    );
    assert_eq!(
        pipeline.health().await.get(&WorkflowId::new("crm")),
        Some(&WorkflowHealth::Healthy)
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn open_circuit_stops_calls_until_the_probe_succeeds() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("crm", CRM_URL)
            .delivery_retry(fast_retry(10))
            .circuit_breaker(3, 10_000)
            .build(),
        WorkflowBuilder::new("audit", AUDIT_URL).build(),
    ])
    .unwrap();
    env.endpoint
        .respond_always(CRM_URL, ScriptedResponse::Status(503))
        .await;
    let pipeline = env.start_pipeline().await.unwrap();
    let crm = WorkflowId::new("crm");

    env.insert("orders", 1, 42).unwrap();

    let pipeline_ref = &pipeline;
    let crm_ref = &crm;
    wait_for("crm circuit opened", || async move {
        pipeline_ref.health().await.get(crm_ref) == Some(&WorkflowHealth::CircuitOpen)
    })
    .await;

    assert_eq!(env.endpoint.calls_to(CRM_URL).await.len(), 3);

    // The other workflow of the source is not affected.
    let env_ref = &env;
    wait_for("audit delivered", || async move {
        env_ref.endpoint.applied(AUDIT_URL).await.len() == 1
    })
    .await;
    assert_eq!(env.endpoint.calls_to(AUDIT_URL).await.len(), 1);

    env.endpoint.recover(CRM_URL).await;

    wait_for("probe delivered the change", || async move {
        env_ref.endpoint.applied(CRM_URL).await.len() == 1
    })
    .await;

    let calls = env.endpoint.calls_to(CRM_URL).await;
    assert_eq!(calls.len(), 4);
    assert!(calls[3].received_at - calls[2].received_at >= Duration::from_secs(10));
    wait_for("crm healthy again", || async move {
        pipeline_ref.health().await.get(crm_ref) == Some(&WorkflowHealth::Healthy)
    })
    .await;

    let metrics = pipeline.workflow_metrics(&crm).await.unwrap().snapshot();
    assert_eq!(metrics.delivery_attempts, 4);
    assert_eq!(metrics.dead_lettered, 0);

    pipeline.shutdown_and_wait().await.unwrap();
}
