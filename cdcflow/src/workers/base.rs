use std::fmt;

use crate::error::ErrorKind;
use crate::types::WorkflowId;

/// Classification of the workers of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// Reads the source and routes changes to workflow lanes.
    Capture,
    /// Transforms and delivers the changes of one workflow.
    Workflow { workflow_id: WorkflowId },
    /// Delivers the outbox records of one exactly-once workflow.
    OutboxRelay { workflow_id: WorkflowId },
}

impl WorkerType {
    /// Error kind reported when the worker panicked.
    pub fn panic_kind(&self) -> ErrorKind {
        match self {
            Self::Capture => ErrorKind::CaptureWorkerPanic,
            Self::Workflow { .. } => ErrorKind::WorkflowWorkerPanic,
            Self::OutboxRelay { .. } => ErrorKind::RelayWorkerPanic,
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => f.write_str("capture"),
            Self::Workflow { workflow_id } => write!(f, "workflow:{workflow_id}"),
            Self::OutboxRelay { workflow_id } => write!(f, "outbox-relay:{workflow_id}"),
        }
    }
}
