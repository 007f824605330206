use std::sync::Arc;
use std::time::Duration;

use cdcflow_config::shared::CircuitBreakerConfig;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::types::WorkflowId;

/// State of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Deliveries flow normally.
    Closed,
    /// Deliveries fail fast until the cool-down ends.
    Open { until: Instant },
    /// The cool-down ended and a single probe delivery is allowed.
    HalfOpen,
}

/// Whether a delivery may reach the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    Allowed,
    /// The delivery is the probe of a half-open circuit.
    Probe,
    /// The circuit is open; no attempt may be made for `retry_in`.
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    probe_in_flight: bool,
}

/// Stops attempts against an endpoint after consecutive failures.
///
/// After `failure_threshold` consecutive failures the circuit opens for `cool_down`. Once the
/// cool-down is over a single probe is let through: its success closes the circuit and its
/// failure opens it again for another cool-down.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    workflow_id: WorkflowId,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    pub fn new(workflow_id: WorkflowId, config: CircuitBreakerConfig) -> Self {
        Self {
            workflow_id,
            inner: Arc::new(Mutex::new(Inner {
                config,
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_in_flight: false,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Applies a new configuration. The current state is kept.
    pub async fn set_config(&self, config: CircuitBreakerConfig) {
        self.inner.lock().await.config = config;
    }

    pub async fn check(&self) -> CircuitDecision {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => CircuitDecision::Allowed,
            CircuitState::Open { until } if now < until => CircuitDecision::Rejected {
                retry_in: until - now,
            },
            CircuitState::Open { .. } => {
                info!(workflow_id = %self.workflow_id, "circuit half-open, probing endpoint");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;

                CircuitDecision::Probe
            }
            CircuitState::HalfOpen if inner.probe_in_flight => CircuitDecision::Rejected {
                retry_in: inner.config.cool_down(),
            },
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;

                CircuitDecision::Probe
            }
        }
    }

    /// Records an answer from the endpoint. Rejections count too: the endpoint is reachable.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            info!(workflow_id = %self.workflow_id, "circuit closed");
        }

        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trips = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= inner.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open { .. } => false,
        };
        if !trips {
            return;
        }

        let cool_down = inner.config.cool_down();
        inner.state = CircuitState::Open {
            until: Instant::now() + cool_down,
        };
        inner.probe_in_flight = false;

        warn!(
            workflow_id = %self.workflow_id,
            consecutive_failures = inner.consecutive_failures,
            cool_down_ms = cool_down.as_millis() as u64,
            "circuit opened"
        );
    }
}
