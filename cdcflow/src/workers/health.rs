use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::types::{WorkflowHealth, WorkflowId};

/// Publishes the health of one workflow.
///
/// Subscribers are only notified when the health actually changes.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    workflow_id: WorkflowId,
    tx: Arc<watch::Sender<WorkflowHealth>>,
}

impl HealthReporter {
    pub fn new(workflow_id: WorkflowId) -> Self {
        let (tx, _) = watch::channel(WorkflowHealth::Healthy);

        Self {
            workflow_id,
            tx: Arc::new(tx),
        }
    }

    pub fn set(&self, health: WorkflowHealth) {
        let workflow_id = &self.workflow_id;
        self.tx.send_if_modified(|current| {
            if *current == health {
                return false;
            }

            info!(%workflow_id, from = %current, to = %health, "workflow health changed");
            *current = health;
            true
        });
    }

    pub fn current(&self) -> WorkflowHealth {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowHealth> {
        self.tx.subscribe()
    }
}
