use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SequenceToken, SourceId, WorkflowId};

/// What a checkpoint tracks progress for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointScope {
    /// Low watermark of the whole source: every change at or below it reached a terminal
    /// state in every workflow it was routed to. Capture resumes after it.
    Source,
    /// Progress of one workflow on the source. Changes at or below it are skipped by that
    /// workflow after a restart.
    Workflow(WorkflowId),
}

impl fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Workflow(workflow_id) => write!(f, "workflow:{workflow_id}"),
        }
    }
}

/// Durable record of how far a source has been processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub source_id: SourceId,
    pub scope: CheckpointScope,
    pub sequence_token: SequenceToken,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn source(source_id: SourceId, sequence_token: SequenceToken) -> Self {
        Self {
            source_id,
            scope: CheckpointScope::Source,
            sequence_token,
            updated_at: Utc::now(),
        }
    }

    pub fn workflow(
        source_id: SourceId,
        workflow_id: WorkflowId,
        sequence_token: SequenceToken,
    ) -> Self {
        Self {
            source_id,
            scope: CheckpointScope::Workflow(workflow_id),
            sequence_token,
            updated_at: Utc::now(),
        }
    }
}
