use std::sync::Arc;

use cdcflow::delivery::memory::ScriptedResponse;
use cdcflow::error::ErrorKind;
use cdcflow::test_utils::pipeline::TestEnvironment;
use cdcflow::test_utils::transformer::ScriptedTransformer;
use cdcflow::test_utils::wait::wait_for;
use cdcflow::test_utils::workflow::WorkflowBuilder;
use cdcflow::types::{DeadLetterPayload, DeadLetterStage, SequenceToken, WorkflowHealth, WorkflowId};
use cdcflow_telemetry::tracing::init_test_tracing;

const CRM_URL: &str = "https://crm.example.com/hooks/orders";
const AUDIT_URL: &str = "https://audit.example.com/ingest";

#[tokio::test(start_paused = true)]
async fn failing_transformer_is_dead_lettered_without_affecting_other_workflows() {
    init_test_tracing();
    let broken = ScriptedTransformer::always_failing();
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("crm", CRM_URL).build(),
        WorkflowBuilder::new("audit", AUDIT_URL)
            .transformer("broken")
            .build(),
    ])
    .unwrap()
    .with_transformer("broken", Arc::new(broken.clone()));
    let pipeline = env.start_pipeline().await.unwrap();
    let audit = WorkflowId::new("audit");

    env.insert("orders", 1, 1).unwrap();
    env.insert("orders", 2, 2).unwrap();

    let env_ref = &env;
    wait_for("both changes settled for every workflow", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(2))
    })
    .await;

    assert_eq!(env.endpoint.applied(CRM_URL).await.len(), 2);
    assert!(env.endpoint.calls_to(AUDIT_URL).await.is_empty());
    assert_eq!(broken.calls(), 6);

    let entries = pipeline.dead_letters().list(Some(&audit)).await.unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry.stage, DeadLetterStage::Transform);
        assert_eq!(entry.attempts, 3);
        assert!(entry.reason.contains("TransformFailed"));
        assert!(matches!(entry.payload, DeadLetterPayload::Event(_)));
    }

    assert_eq!(
        env.workflow_checkpoint("audit").await.unwrap(),
        Some(SequenceToken::new(2))
    );
    let health = pipeline.health().await;
    assert_eq!(health.get(&WorkflowId::new("crm")), Some(&WorkflowHealth::Healthy));

    let crm_metrics = pipeline
        .workflow_metrics(&WorkflowId::new("crm"))
        .await
        .unwrap()
        .snapshot();
    let audit_metrics = pipeline.workflow_metrics(&audit).await.unwrap().snapshot();
    assert_eq!(crm_metrics.transform_failures, 0);
    assert_eq!(audit_metrics.transform_failures, 6);
    assert_eq!(audit_metrics.dead_lettered, 2);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn replayed_transform_dead_letter_is_delivered() {
    init_test_tracing();
    let flaky = ScriptedTransformer::failing_first(3);
    let env = TestEnvironment::new(vec![
        WorkflowBuilder::new("audit", AUDIT_URL)
            .transformer("flaky")
            .build(),
    ])
    .unwrap()
    .with_transformer("flaky", Arc::new(flaky.clone()));
    let pipeline = env.start_pipeline().await.unwrap();
    let audit = WorkflowId::new("audit");

    env.insert("orders", 1, 9).unwrap();

    let pipeline_ref = &pipeline;
    let audit_ref = &audit;
    wait_for("change dead lettered", || async move {
        pipeline_ref
            .dead_letters()
            .list(Some(audit_ref))
            .await
            .unwrap()
            .len()
            == 1
    })
    .await;

    let entry = pipeline.dead_letters().list(Some(&audit)).await.unwrap()[0].clone();
    let replayed = pipeline.replay_dead_letter(entry.id).await.unwrap();
    assert_eq!(replayed.replay_count, 1);

    let env_ref = &env;
    wait_for("replayed change delivered", || async move {
        env_ref.endpoint.applied(AUDIT_URL).await.len() == 1
    })
    .await;

    assert_eq!(flaky.calls(), 4);
    let applied = env.endpoint.applied(AUDIT_URL).await;
    assert_eq!(applied[0].0.as_str(), "shop-db:orders:id=9:1");
    // Entries are kept after a replay.
    assert_eq!(pipeline.dead_letters().list(Some(&audit)).await.unwrap().len(), 1);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rejected_delivery_is_dead_lettered_and_replayable() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![WorkflowBuilder::new("crm", CRM_URL).build()]).unwrap();
    env.endpoint
        .script(CRM_URL, [ScriptedResponse::Status(422)])
        .await;
    let pipeline = env.start_pipeline().await.unwrap();
    let crm = WorkflowId::new("crm");

    env.insert("orders", 1, 5).unwrap();

    let env_ref = &env;
    wait_for("change settled", || async move {
        env_ref.source_checkpoint().await.unwrap() == Some(SequenceToken::new(1))
    })
    .await;

    let entries = pipeline.dead_letters().list(Some(&crm)).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, DeadLetterStage::Delivery);
    assert_eq!(entries[0].attempts, 1);
    assert!(entries[0].reason.contains("EndpointRejected"));
    assert_eq!(env.endpoint.calls_to(CRM_URL).await.len(), 1);

    pipeline.replay_dead_letter(entries[0].id).await.unwrap();

    wait_for("replayed task delivered", || async move {
        env_ref.endpoint.applied(CRM_URL).await.len() == 1
    })
    .await;

    let calls = env.endpoint.calls_to(CRM_URL).await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].idempotency_key, calls[1].idempotency_key);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn replaying_an_unknown_dead_letter_fails() {
    init_test_tracing();
    let env = TestEnvironment::new(vec![WorkflowBuilder::new("crm", CRM_URL).build()]).unwrap();
    let pipeline = env.start_pipeline().await.unwrap();

    let err = pipeline
        .replay_dead_letter(cdcflow::types::DeadLetterId::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DeadLetterNotFound);

    pipeline.shutdown_and_wait().await.unwrap();
}
