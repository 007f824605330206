use std::sync::Arc;
use std::time::Duration;

use cdcflow::test_utils::pipeline::{TestEnvironment, TestPipeline};
use cdcflow::test_utils::transformer::GatedTransformer;
use cdcflow::test_utils::wait::wait_for;
use cdcflow::test_utils::workflow::WorkflowBuilder;
use cdcflow::types::{SequenceToken, WorkflowId};
use cdcflow_config::shared::WorkflowDefinition;
use cdcflow_telemetry::tracing::init_test_tracing;

const CRM_URL: &str = "https://crm.example.com/hooks/orders";
const AUDIT_URL: &str = "https://audit.example.com/ingest";

#[tokio::test(start_paused = true)]
async fn reloads_apply_to_changes_captured_afterwards() {
    init_test_tracing();
    let crm = WorkflowBuilder::new("crm", CRM_URL).build();
    let audit = WorkflowBuilder::new("audit", AUDIT_URL).build();
    let env = TestEnvironment::new(vec![crm.clone()]).unwrap();
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 1).unwrap();
    let env_ref = &env;
    wait_for("first change delivered", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(1))
    })
    .await;

    env.config_store
        .replace(vec![crm.clone(), audit.clone()])
        .unwrap();
    env.insert("orders", 2, 2).unwrap();
    wait_for("second change settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(2))
    })
    .await;

    let audit_applied = env.endpoint.applied(AUDIT_URL).await;
    assert_eq!(audit_applied.len(), 1);
    assert_eq!(audit_applied[0].0.as_str(), "shop-db:orders:id=2:2");

    env.config_store.replace(vec![audit]).unwrap();
    env.insert("orders", 3, 3).unwrap();
    wait_for("third change settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(3))
    })
    .await;

    assert_eq!(env.endpoint.applied(CRM_URL).await.len(), 2);
    assert_eq!(env.endpoint.applied(AUDIT_URL).await.len(), 2);
    assert!(pipeline.health().await.get(&WorkflowId::new("crm")).is_none());

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn invalid_reload_keeps_the_running_workflows() {
    init_test_tracing();
    let crm = WorkflowBuilder::new("crm", CRM_URL).build();
    let env = TestEnvironment::new(vec![crm.clone()]).unwrap();
    let pipeline = env.start_pipeline().await.unwrap();

    let invalid = WorkflowBuilder::new("audit", "ftp://audit.example.com").build();
    assert!(env.config_store.replace(vec![crm, invalid]).is_err());

    env.insert("orders", 1, 1).unwrap();
    let env_ref = &env;
    wait_for("change delivered", || async move {
        env_ref.endpoint.applied(CRM_URL).await.len() == 1
    })
    .await;

    assert_eq!(env.config_store.snapshot().version(), 1);
    assert_eq!(pipeline.health().await.len(), 1);

    pipeline.shutdown_and_wait().await.unwrap();
}

/// Retires `crm` while its lane is held on change 1, brings it back and captures change 2.
async fn readd_while_retired_lane_is_busy(
    env: &TestEnvironment,
    pipeline: &TestPipeline,
    gate: &GatedTransformer,
    crm: WorkflowDefinition,
) {
    env.insert("orders", 1, 1).unwrap();
    wait_for("change 1 held by the transformer", || async move {
        gate.waiting() == 1
    })
    .await;

    env.config_store.replace(Vec::new()).unwrap();
    wait_for("crm retired", || async move {
        pipeline.health().await.is_empty()
    })
    .await;

    env.config_store.replace(vec![crm]).unwrap();
    wait_for("crm active again", || async move {
        pipeline.health().await.contains_key(&WorkflowId::new("crm"))
    })
    .await;

    env.insert("orders", 2, 2).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn readded_workflow_waits_for_its_retired_lane() {
    init_test_tracing();
    let gate = GatedTransformer::holding(&[1]);
    let crm = WorkflowBuilder::new("crm", CRM_URL)
        .transformer("gated")
        .transform_timeout_ms(600_000)
        .build();
    let env = TestEnvironment::new(vec![crm.clone()])
        .unwrap()
        .with_transformer("gated", Arc::new(gate.clone()));
    let pipeline = env.start_pipeline().await.unwrap();

    readd_while_retired_lane_is_busy(&env, &pipeline, &gate, crm).await;

    assert_eq!(env.workflow_checkpoint("crm").await.unwrap(), None);
    assert!(env.endpoint.applied(CRM_URL).await.is_empty());

    gate.open();
    let env_ref = &env;
    wait_for("both changes settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(2))
    })
    .await;

    let applied = env.endpoint.applied(CRM_URL).await;
    let keys: Vec<_> = applied.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(keys, vec!["shop-db:orders:id=1:1", "shop-db:orders:id=2:2"]);
    assert_eq!(
        env.workflow_checkpoint("crm").await.unwrap(),
        Some(SequenceToken::new(2))
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn readded_workflow_loses_nothing_across_a_restart() {
    init_test_tracing();
    let gate = GatedTransformer::holding(&[1]);
    let crm = WorkflowBuilder::new("crm", CRM_URL)
        .transformer("gated")
        .transform_timeout_ms(600_000)
        .build();
    let env = TestEnvironment::new(vec![crm.clone()])
        .unwrap()
        .with_transformer("gated", Arc::new(gate.clone()));
    let pipeline = env.start_pipeline().await.unwrap();

    readd_while_retired_lane_is_busy(&env, &pipeline, &gate, crm).await;
    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(env.workflow_checkpoint("crm").await.unwrap(), None);
    assert_eq!(env.source_checkpoint().await.unwrap(), None);

    gate.open();
    let pipeline = env.start_pipeline().await.unwrap();
    let env_ref = &env;
    wait_for("both changes delivered after the restart", || async move {
        env_ref.workflow_checkpoint("crm").await.unwrap() == Some(SequenceToken::new(2))
    })
    .await;

    assert_eq!(env.endpoint.applied(CRM_URL).await.len(), 2);

    pipeline.shutdown_and_wait().await.unwrap();
}
