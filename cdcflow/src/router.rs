use std::sync::Arc;

use cdcflow_config::shared::WorkflowDefinition;

use crate::configuration::ConfigSnapshot;
use crate::types::{ChangeEvent, SourceId, WorkflowId};

/// Resolves which workflows a change applies to.
///
/// Routing is a pure function of the snapshot the router holds. A new snapshot only applies
/// to changes routed after [`WorkflowRouter::update`]; already routed changes keep the
/// definition they were routed with.
#[derive(Debug, Clone)]
pub struct WorkflowRouter {
    source_id: SourceId,
    snapshot: Arc<ConfigSnapshot>,
}

impl WorkflowRouter {
    pub fn new(source_id: SourceId, snapshot: Arc<ConfigSnapshot>) -> Self {
        Self {
            source_id,
            snapshot,
        }
    }

    pub fn update(&mut self, snapshot: Arc<ConfigSnapshot>) {
        self.snapshot = snapshot;
    }

    pub fn snapshot(&self) -> &Arc<ConfigSnapshot> {
        &self.snapshot
    }

    /// Returns the definitions of every workflow subscribed to the event's table, ordered by
    /// workflow id. Events of another source match nothing.
    pub fn route(&self, event: &ChangeEvent) -> Vec<Arc<WorkflowDefinition>> {
        if event.source_id != self.source_id {
            return Vec::new();
        }

        self.snapshot
            .for_source(&self.source_id)
            .filter(|workflow| workflow.table_filter.matches(&event.table))
            .cloned()
            .collect()
    }

    /// Same as [`WorkflowRouter::route`], returning only the workflow ids.
    pub fn route_ids(&self, event: &ChangeEvent) -> Vec<WorkflowId> {
        self.route(event)
            .into_iter()
            .map(|workflow| workflow.workflow_id.clone())
            .collect()
    }
}
