use cdcflow::delivery::memory::ScriptedResponse;
use cdcflow::error::ErrorKind;
use cdcflow::test_utils::pipeline::TestEnvironment;
use cdcflow::test_utils::wait::wait_for;
use cdcflow::test_utils::workflow::{WorkflowBuilder, fast_retry};
use cdcflow::types::{SequenceToken, WorkflowHealth, WorkflowId};
use cdcflow_telemetry::tracing::init_test_tracing;

const CRM_URL: &str = "https://crm.example.com/hooks/orders";
const AUDIT_URL: &str = "https://audit.example.com/ingest";

#[tokio::test(start_paused = true)]
async fn restart_resumes_after_the_checkpoint_without_loss_or_resend() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![WorkflowBuilder::new("crm", CRM_URL).build()]).unwrap();
    let pipeline = env.start_pipeline().await.unwrap();

    for token in 1..=3 {
        env.insert("orders", token, token * 10).unwrap();
    }

    let env_ref = &env;
    wait_for("first changes settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(3))
    })
    .await;
    pipeline.shutdown_and_wait().await.unwrap();

    // Changes committed while the pipeline is down.
    env.insert("orders", 4, 40).unwrap();
    env.insert("orders", 5, 50).unwrap();

    let pipeline = env.start_pipeline().await.unwrap();
    wait_for("changes after the restart delivered", || async move {
        env_ref.endpoint.applied(CRM_URL).await.len() == 5
    })
    .await;

    let keys: Vec<String> = env
        .endpoint
        .applied(CRM_URL)
        .await
        .into_iter()
        .map(|(key, _)| key.to_string())
        .collect();
    assert_eq!(
        keys,
        vec![
            "shop-db:orders:id=10:1",
            "shop-db:orders:id=20:2",
            "shop-db:orders:id=30:3",
            "shop-db:orders:id=40:4",
            "shop-db:orders:id=50:5",
        ]
    );
    assert_eq!(env.endpoint.calls_to(CRM_URL).await.len(), 5);
    assert_eq!(env.endpoint.duplicates(CRM_URL).await, 0);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_workflow_holds_back_the_source_checkpoint_only() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("crm", CRM_URL).build(),
        WorkflowBuilder::new("audit", AUDIT_URL)
            .delivery_retry(fast_retry(1_000))
            .circuit_breaker(1_000, 1_000)
            .build(),
    ])
    .unwrap();
    env.endpoint
        .respond_always(AUDIT_URL, ScriptedResponse::Status(503))
        .await;
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 1).unwrap();
    env.insert("orders", 2, 2).unwrap();

    let env_ref = &env;
    wait_for("crm delivered and audit retrying", || async move {
        env_ref.workflow_checkpoint("crm").await.unwrap() == Some(SequenceToken::new(2))
            && env_ref.endpoint.calls_to(AUDIT_URL).await.len() >= 2
    })
    .await;

    assert_eq!(env.source_checkpoint().await.unwrap(), None);
    assert_eq!(env.workflow_checkpoint("audit").await.unwrap(), None);
    assert!(matches!(
        pipeline.health().await.get(&WorkflowId::new("audit")),
        Some(WorkflowHealth::Degraded { .. })
    ));

    pipeline.shutdown_and_wait().await.unwrap();

    // After the restart capture starts over, crm skips what it already delivered.
    env.endpoint.recover(AUDIT_URL).await;
    let pipeline = env.start_pipeline().await.unwrap();

    wait_for("audit caught up", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(2))
    })
    .await;

    assert_eq!(env.endpoint.calls_to(CRM_URL).await.len(), 2);
    assert_eq!(env.endpoint.applied(AUDIT_URL).await.len(), 2);
    assert_eq!(
        env.workflow_checkpoint("audit").await.unwrap(),
        Some(SequenceToken::new(2))
    );

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn source_failure_stops_every_workflow_of_the_source() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("crm", CRM_URL).build(),
        WorkflowBuilder::new("audit", AUDIT_URL).build(),
    ])
    .unwrap();
    let pipeline = env.start_pipeline().await.unwrap();

    env.insert("orders", 1, 1).unwrap();
    let env_ref = &env;
    wait_for("first change settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(1))
    })
    .await;

    env.source
        .fail_next_reads(3, ErrorKind::SourceConnectionFailed)
        .unwrap();
    env.source
        .fail_open_stream(ErrorKind::SourceConnectionFailed)
        .unwrap();

    let pipeline_ref = &pipeline;
    wait_for("workflows stopped", || async move {
        pipeline_ref
            .health()
            .await
            .values()
            .all(WorkflowHealth::is_stopped)
    })
    .await;

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kinds(), vec![ErrorKind::SourceFatal]);
    assert_eq!(
        env.source_checkpoint().await.unwrap(),
        Some(SequenceToken::new(1))
    );
}
