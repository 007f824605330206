use std::sync::Arc;

use cdcflow_config::shared::{CaptureConfig, OutboxRelayConfig, PipelineConfig, WorkflowDefinition};
use serde_json::json;

use crate::configuration::memory::MemoryConfigurationStore;
use crate::delivery::memory::MemoryEndpoint;
use crate::error::FlowResult;
use crate::pipeline::Pipeline;
use crate::source::memory::MemoryChangeSource;
use crate::store::CheckpointStore;
use crate::store::memory::MemoryStore;
use crate::test_utils::workflow::{TEST_SOURCE_ID, fast_retry};
use crate::transform::{Transformer, TransformerRegistry};
use crate::types::{ChangeEvent, CheckpointScope, Operation, SequenceToken, SourceId, WorkflowId};

/// Pipeline assembled from in-memory components.
pub type TestPipeline =
    Pipeline<MemoryChangeSource, MemoryStore, MemoryConfigurationStore, MemoryEndpoint>;

/// The in-memory components behind a [`TestPipeline`].
///
/// Every component is shared by clones, so a test can start a second pipeline on the same
/// source and store to simulate a restart.
#[derive(Debug, Clone)]
pub struct TestEnvironment {
    pub source: MemoryChangeSource,
    pub store: MemoryStore,
    pub config_store: MemoryConfigurationStore,
    pub endpoint: MemoryEndpoint,
    pub registry: TransformerRegistry,
}

impl TestEnvironment {
    pub fn new(workflows: Vec<WorkflowDefinition>) -> FlowResult<Self> {
        Ok(Self {
            source: MemoryChangeSource::new(SourceId::new(TEST_SOURCE_ID)),
            store: MemoryStore::new(),
            config_store: MemoryConfigurationStore::new(workflows)?,
            endpoint: MemoryEndpoint::default(),
            registry: TransformerRegistry::with_builtins(),
        })
    }

    pub fn with_transformer(mut self, name: &str, transformer: Arc<dyn Transformer>) -> Self {
        self.registry.register(name, transformer);
        self
    }

    /// Capture and state store writes retry quickly and the outbox relay polls every 20ms.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            source_id: SourceId::new(TEST_SOURCE_ID),
            capture: CaptureConfig {
                retry: fast_retry(3),
                ..CaptureConfig::default()
            },
            outbox_relay: OutboxRelayConfig {
                poll_interval_ms: 20,
                batch_size: 10,
            },
            store_retry: fast_retry(3),
        }
    }

    pub fn create_pipeline(&self) -> TestPipeline {
        Pipeline::new(
            self.pipeline_config(),
            self.source.clone(),
            self.store.clone(),
            self.config_store.clone(),
            self.registry.clone(),
            self.endpoint.clone(),
        )
    }

    pub async fn start_pipeline(&self) -> FlowResult<TestPipeline> {
        let mut pipeline = self.create_pipeline();
        pipeline.start().await?;

        Ok(pipeline)
    }

    /// Appends an insert of `{"id": id}` on `table`.
    pub fn insert(&self, table: &str, token: u64, id: u64) -> FlowResult<ChangeEvent> {
        self.source.push_change(
            table,
            Operation::Insert,
            token,
            None,
            Some(json!({ "id": id })),
        )
    }

    /// Stored source checkpoint, the low watermark of every workflow.
    pub async fn source_checkpoint(&self) -> FlowResult<Option<SequenceToken>> {
        self.checkpoint(CheckpointScope::Source).await
    }

    /// Stored checkpoint of one workflow lane.
    pub async fn workflow_checkpoint(&self, workflow_id: &str) -> FlowResult<Option<SequenceToken>> {
        self.checkpoint(CheckpointScope::Workflow(WorkflowId::new(workflow_id)))
            .await
    }

    async fn checkpoint(&self, scope: CheckpointScope) -> FlowResult<Option<SequenceToken>> {
        let checkpoint = self
            .store
            .get_checkpoint(&SourceId::new(TEST_SOURCE_ID), &scope)
            .await?;

        Ok(checkpoint.map(|checkpoint| checkpoint.sequence_token))
    }
}
