use std::collections::HashSet;
use std::sync::Arc;

use cdcflow_config::shared::{ValidationError, WorkflowDefinition};
use tokio::sync::watch;
use tracing::info;

use crate::configuration::{ConfigSnapshot, ConfigurationStore};
use crate::error::FlowResult;

/// Configuration store holding definitions in memory.
///
/// The runner fills it from the configuration file; tests use [`MemoryConfigurationStore::replace`]
/// to simulate reloads.
#[derive(Debug, Clone)]
pub struct MemoryConfigurationStore {
    snapshot: Arc<watch::Sender<Arc<ConfigSnapshot>>>,
}

impl MemoryConfigurationStore {
    /// Validates `workflows` and publishes them as version 1.
    pub fn new(workflows: Vec<WorkflowDefinition>) -> FlowResult<Self> {
        validate_workflows(&workflows)?;

        let (snapshot, _) = watch::channel(Arc::new(ConfigSnapshot::new(1, workflows)));

        Ok(Self {
            snapshot: Arc::new(snapshot),
        })
    }

    /// Atomically replaces every definition and returns the new snapshot version.
    ///
    /// Invalid definitions are rejected and the current snapshot stays active.
    pub fn replace(&self, workflows: Vec<WorkflowDefinition>) -> FlowResult<u64> {
        validate_workflows(&workflows)?;

        let version = self.snapshot.borrow().version() + 1;
        self.snapshot
            .send_replace(Arc::new(ConfigSnapshot::new(version, workflows)));

        info!(version, "published new workflow configuration");

        Ok(version)
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.borrow().clone()
    }
}

fn validate_workflows(workflows: &[WorkflowDefinition]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for workflow in workflows {
        workflow.validate()?;

        if !seen.insert(&workflow.workflow_id) {
            return Err(ValidationError::DuplicateWorkflow(
                workflow.workflow_id.to_string(),
            ));
        }
    }

    Ok(())
}

impl ConfigurationStore for MemoryConfigurationStore {
    async fn get_active_workflows(&self) -> FlowResult<Vec<WorkflowDefinition>> {
        let snapshot = self.snapshot();

        Ok(snapshot
            .workflows()
            .map(|workflow| workflow.as_ref().clone())
            .collect())
    }

    fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.snapshot.subscribe()
    }
}
