use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{
    ChangeLogSourceConfig, PipelineConfig, StateStoreConfig, TransformerConfig, ValidationError,
    WorkflowDefinition,
};

/// Name under which the passthrough transformer is always available.
pub const BUILTIN_PASSTHROUGH: &str = "passthrough";

/// A pipeline together with the source it reads from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePipelineConfig {
    pub pipeline: PipelineConfig,
    pub source: ChangeLogSourceConfig,
}

/// Top level configuration of the runner binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Added to every log line when set.
    #[serde(default)]
    pub project_ref: Option<String>,
    pub state_store: StateStoreConfig,
    pub pipelines: Vec<SourcePipelineConfig>,
    #[serde(default)]
    pub transformers: BTreeMap<String, TransformerConfig>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.state_store.validate()?;

        let mut sources = HashSet::new();
        for entry in &self.pipelines {
            entry.pipeline.validate()?;
            entry.source.validate()?;

            if !sources.insert(&entry.pipeline.source_id) {
                return Err(ValidationError::DuplicatePipeline(
                    entry.pipeline.source_id.to_string(),
                ));
            }
        }

        let mut workflows = HashSet::new();
        for workflow in &self.workflows {
            workflow.validate()?;

            if !workflows.insert(&workflow.workflow_id) {
                return Err(ValidationError::DuplicateWorkflow(
                    workflow.workflow_id.to_string(),
                ));
            }

            if workflow.transformer_ref != BUILTIN_PASSTHROUGH
                && !self.transformers.contains_key(&workflow.transformer_ref)
            {
                return Err(ValidationError::UnknownTransformer {
                    workflow_id: workflow.workflow_id.to_string(),
                    transformer_ref: workflow.transformer_ref.clone(),
                });
            }
        }

        Ok(())
    }
}

impl Config for RunnerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
