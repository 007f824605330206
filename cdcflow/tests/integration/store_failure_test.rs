use cdcflow::error::ErrorKind;
use cdcflow::test_utils::pipeline::TestEnvironment;
use cdcflow::test_utils::wait::wait_for;
use cdcflow::test_utils::workflow::WorkflowBuilder;
use cdcflow::types::{CheckpointScope, SequenceToken, WorkflowHealth, WorkflowId};
use cdcflow_telemetry::tracing::init_test_tracing;

const CRM_URL: &str = "https://crm.example.com/hooks/orders";
const AUDIT_URL: &str = "https://audit.example.com/ingest";

fn crm_scope() -> CheckpointScope {
    CheckpointScope::Workflow(WorkflowId::new("crm"))
}

#[tokio::test(start_paused = true)]
async fn transient_workflow_checkpoint_failure_is_retried() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![WorkflowBuilder::new("crm", CRM_URL).build()]).unwrap();
    env.store
        .fail_next_checkpoint_writes(crm_scope(), 1, ErrorKind::StateStoreQueryFailed)
        .await;
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 1).unwrap();
    env.insert("orders", 2, 2).unwrap();
    let env_ref = &env;
    wait_for("both changes settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(2))
    })
    .await;

    assert_eq!(env.endpoint.applied(CRM_URL).await.len(), 2);
    assert_eq!(
        env.workflow_checkpoint("crm").await.unwrap(),
        Some(SequenceToken::new(2))
    );
    assert_eq!(
        pipeline.health().await.get(&WorkflowId::new("crm")),
        Some(&WorkflowHealth::Healthy)
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_source_checkpoint_failure_is_retried() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![WorkflowBuilder::new("crm", CRM_URL).build()]).unwrap();
    env.store
        .fail_next_checkpoint_writes(CheckpointScope::Source, 1, ErrorKind::StateStoreQueryFailed)
        .await;
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 1).unwrap();
    let env_ref = &env;
    wait_for("first change settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(1))
    })
    .await;

    env.insert("orders", 2, 2).unwrap();
    wait_for("second change settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(2))
    })
    .await;

    assert_eq!(env.endpoint.applied(CRM_URL).await.len(), 2);
    assert_eq!(
        pipeline.health().await.get(&WorkflowId::new("crm")),
        Some(&WorkflowHealth::Healthy)
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn persistent_workflow_checkpoint_failure_only_stops_that_workflow() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("crm", CRM_URL).build(),
        WorkflowBuilder::new("audit", AUDIT_URL).build(),
    ])
    .unwrap();
    env.store
        .fail_next_checkpoint_writes(crm_scope(), 100, ErrorKind::StateStoreConnectionFailed)
        .await;
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 1).unwrap();
    let pipeline_ref = &pipeline;
    wait_for("crm stopped", || async move {
        pipeline_ref
            .health()
            .await
            .get(&WorkflowId::new("crm"))
            .is_some_and(WorkflowHealth::is_stopped)
    })
    .await;

    env.insert("orders", 2, 2).unwrap();
    let env_ref = &env;
    wait_for("audit delivered both changes", || async move {
        env_ref.endpoint.applied(AUDIT_URL).await.len() == 2
    })
    .await;

    assert_eq!(
        pipeline.health().await.get(&WorkflowId::new("audit")),
        Some(&WorkflowHealth::Healthy)
    );
    // Change 1 is still owed by crm and is captured again after a restart.
    assert_eq!(env.source_checkpoint().await.unwrap(), None);

    let err = pipeline.shutdown_and_wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::StateStoreConnectionFailed]);
}

#[tokio::test(start_paused = true)]
async fn persistent_source_checkpoint_failure_stops_every_workflow() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("crm", CRM_URL).tables(&["orders"]).build(),
        WorkflowBuilder::new("audit", AUDIT_URL).tables(&["orders"]).build(),
    ])
    .unwrap();
    env.store
        .fail_next_checkpoint_writes(CheckpointScope::Source, 100, ErrorKind::StateStoreQueryFailed)
        .await;
    let pipeline = env.start_pipeline().await.unwrap();

    // Routed nowhere, so capture writes the source checkpoint itself.
    env.insert("customers", 1, 1).unwrap();
    let pipeline_ref = &pipeline;
    wait_for("workflows stopped", || async move {
        let health = pipeline_ref.health().await;
        health.len() == 2 && health.values().all(WorkflowHealth::is_stopped)
    })
    .await;

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::StateStoreQueryFailed]);
    assert_eq!(env.source_checkpoint().await.unwrap(), None);
}
