use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use cdcflow_config::shared::WorkflowDefinition;
use tokio::sync::watch;

use crate::error::FlowResult;
use crate::types::{SourceId, WorkflowId};

/// Immutable set of active workflow definitions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSnapshot {
    version: u64,
    workflows: BTreeMap<WorkflowId, Arc<WorkflowDefinition>>,
}

impl ConfigSnapshot {
    pub fn new(version: u64, workflows: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        let workflows = workflows
            .into_iter()
            .map(|workflow| (workflow.workflow_id.clone(), Arc::new(workflow)))
            .collect();

        Self { version, workflows }
    }

    /// Incremented on every reload.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, workflow_id: &WorkflowId) -> Option<&Arc<WorkflowDefinition>> {
        self.workflows.get(workflow_id)
    }

    pub fn workflows(&self) -> impl Iterator<Item = &Arc<WorkflowDefinition>> {
        self.workflows.values()
    }

    /// Workflows reading from `source_id`, ordered by workflow id.
    pub fn for_source<'a>(
        &'a self,
        source_id: &'a SourceId,
    ) -> impl Iterator<Item = &'a Arc<WorkflowDefinition>> + 'a {
        self.workflows
            .values()
            .filter(move |workflow| &workflow.source_id == source_id)
    }
}

/// Owner of the workflow definitions consumed by pipelines.
pub trait ConfigurationStore {
    /// Returns the definitions of the current snapshot.
    fn get_active_workflows(
        &self,
    ) -> impl Future<Output = FlowResult<Vec<WorkflowDefinition>>> + Send;

    /// Subscribes to snapshot changes. The receiver starts with the current snapshot.
    fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>>;
}
