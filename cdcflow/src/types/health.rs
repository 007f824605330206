use std::fmt;

/// Health of a workflow as seen by operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowHealth {
    Healthy,
    /// Deliveries are failing but still being retried.
    Degraded { reason: String },
    /// The endpoint circuit is open and deliveries fail fast.
    CircuitOpen,
    /// The workflow no longer processes events.
    Stopped { reason: String },
}

impl WorkflowHealth {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

impl fmt::Display for WorkflowHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded { reason } => write!(f, "degraded: {reason}"),
            Self::CircuitOpen => f.write_str("circuit open"),
            Self::Stopped { reason } => write!(f, "stopped: {reason}"),
        }
    }
}
