//! Metrics definitions for cdcflow pipelines.
//!
//! Every metric is published through the [`metrics`] facade. Per workflow values are also
//! kept in-process in [`WorkflowMetrics`] so they can be inspected without a recorder.

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::types::{DeadLetterStage, SourceId, WorkflowId};

/// Label for the source id in metrics.
pub const SOURCE_ID_LABEL: &str = "source_id";

/// Label for the workflow id in metrics.
pub const WORKFLOW_ID_LABEL: &str = "workflow_id";

/// Label for the pipeline stage in metrics.
pub const STAGE_LABEL: &str = "stage";

/// Label for the outcome of a delivery attempt in metrics.
pub const OUTCOME_LABEL: &str = "outcome";

/// Counter for changes read from a source.
pub const CDCFLOW_EVENTS_CAPTURED_TOTAL: &str = "cdcflow_events_captured_total";

/// Counter for changes that matched no workflow.
pub const CDCFLOW_EVENTS_UNROUTED_TOTAL: &str = "cdcflow_events_unrouted_total";

/// Gauge for the number of positions a checkpoint trails the last captured change.
pub const CDCFLOW_CHECKPOINT_LAG: &str = "cdcflow_checkpoint_lag";

/// Counter for failed transformer invocations.
pub const CDCFLOW_TRANSFORM_FAILURES_TOTAL: &str = "cdcflow_transform_failures_total";

/// Counter for delivery attempts that reached the endpoint client.
pub const CDCFLOW_DELIVERY_ATTEMPTS_TOTAL: &str = "cdcflow_delivery_attempts_total";

/// Histogram for the duration of delivery attempts.
pub const CDCFLOW_DELIVERY_LATENCY_SECONDS: &str = "cdcflow_delivery_latency_seconds";

/// Counter for dead lettered items.
pub const CDCFLOW_DEADLETTER_TOTAL: &str = "cdcflow_deadletter_total";

static REGISTER_METRICS: Once = Once::new();

/// Registers metric descriptions. Calling it more than once has no effect.
pub fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            CDCFLOW_EVENTS_CAPTURED_TOTAL,
            Unit::Count,
            "Changes read from the source, routed or not."
        );
        describe_counter!(
            CDCFLOW_EVENTS_UNROUTED_TOTAL,
            Unit::Count,
            "Changes that matched no active workflow and were dropped."
        );
        describe_gauge!(
            CDCFLOW_CHECKPOINT_LAG,
            Unit::Count,
            "Sequence positions between the last captured change and the checkpoint."
        );
        describe_counter!(
            CDCFLOW_TRANSFORM_FAILURES_TOTAL,
            Unit::Count,
            "Failed transformer invocations, timeouts and panics included."
        );
        describe_counter!(
            CDCFLOW_DELIVERY_ATTEMPTS_TOTAL,
            Unit::Count,
            "Delivery attempts made against workflow endpoints."
        );
        describe_histogram!(
            CDCFLOW_DELIVERY_LATENCY_SECONDS,
            Unit::Seconds,
            "Duration of delivery attempts."
        );
        describe_counter!(
            CDCFLOW_DEADLETTER_TOTAL,
            Unit::Count,
            "Items moved to the dead letter sink."
        );
    });
}

/// Outcome label of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Retryable,
    Terminal,
}

impl AttemptOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Retryable => "retryable",
            Self::Terminal => "terminal",
        }
    }
}

/// Counters of one workflow.
#[derive(Debug)]
pub struct WorkflowMetrics {
    source_id: SourceId,
    workflow_id: WorkflowId,
    events_routed: AtomicU64,
    transform_failures: AtomicU64,
    delivery_attempts: AtomicU64,
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    checkpoint_lag: AtomicU64,
    max_delivery_latency_micros: AtomicU64,
}

/// Point in time copy of [`WorkflowMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkflowMetricsSnapshot {
    pub events_routed: u64,
    pub transform_failures: u64,
    pub delivery_attempts: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub checkpoint_lag: u64,
    pub max_delivery_latency: Duration,
}

impl WorkflowMetrics {
    pub fn new(source_id: SourceId, workflow_id: WorkflowId) -> Arc<Self> {
        Arc::new(Self {
            source_id,
            workflow_id,
            events_routed: AtomicU64::new(0),
            transform_failures: AtomicU64::new(0),
            delivery_attempts: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            checkpoint_lag: AtomicU64::new(0),
            max_delivery_latency_micros: AtomicU64::new(0),
        })
    }

    pub fn record_routed(&self) {
        self.events_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transform_failure(&self) {
        self.transform_failures.fetch_add(1, Ordering::Relaxed);
        counter!(
            CDCFLOW_TRANSFORM_FAILURES_TOTAL,
            SOURCE_ID_LABEL => self.source_id.to_string(),
            WORKFLOW_ID_LABEL => self.workflow_id.to_string(),
        )
        .increment(1);
    }

    /// Records a delivery attempt that reached the endpoint client and how long it took.
    pub fn record_delivery_attempt(&self, latency: Duration, outcome: AttemptOutcome) {
        self.delivery_attempts.fetch_add(1, Ordering::Relaxed);
        if outcome == AttemptOutcome::Delivered {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.max_delivery_latency_micros
            .fetch_max(micros, Ordering::Relaxed);

        counter!(
            CDCFLOW_DELIVERY_ATTEMPTS_TOTAL,
            SOURCE_ID_LABEL => self.source_id.to_string(),
            WORKFLOW_ID_LABEL => self.workflow_id.to_string(),
            OUTCOME_LABEL => outcome.as_str(),
        )
        .increment(1);
        histogram!(
            CDCFLOW_DELIVERY_LATENCY_SECONDS,
            SOURCE_ID_LABEL => self.source_id.to_string(),
            WORKFLOW_ID_LABEL => self.workflow_id.to_string(),
        )
        .record(latency.as_secs_f64());
    }

    pub fn record_dead_letter(&self, stage: DeadLetterStage) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        counter!(
            CDCFLOW_DEADLETTER_TOTAL,
            SOURCE_ID_LABEL => self.source_id.to_string(),
            WORKFLOW_ID_LABEL => self.workflow_id.to_string(),
            STAGE_LABEL => stage.as_str(),
        )
        .increment(1);
    }

    pub fn set_checkpoint_lag(&self, lag: u64) {
        self.checkpoint_lag.store(lag, Ordering::Relaxed);
        gauge!(
            CDCFLOW_CHECKPOINT_LAG,
            SOURCE_ID_LABEL => self.source_id.to_string(),
            WORKFLOW_ID_LABEL => self.workflow_id.to_string(),
        )
        .set(lag as f64);
    }

    pub fn snapshot(&self) -> WorkflowMetricsSnapshot {
        WorkflowMetricsSnapshot {
            events_routed: self.events_routed.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            delivery_attempts: self.delivery_attempts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            checkpoint_lag: self.checkpoint_lag.load(Ordering::Relaxed),
            max_delivery_latency: Duration::from_micros(
                self.max_delivery_latency_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Counters of one source.
#[derive(Debug)]
pub struct SourceMetrics {
    source_id: SourceId,
    events_captured: AtomicU64,
    events_unrouted: AtomicU64,
    checkpoint_lag: AtomicU64,
}

/// Point in time copy of [`SourceMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceMetricsSnapshot {
    pub events_captured: u64,
    pub events_unrouted: u64,
    pub checkpoint_lag: u64,
}

impl SourceMetrics {
    pub fn new(source_id: SourceId) -> Arc<Self> {
        Arc::new(Self {
            source_id,
            events_captured: AtomicU64::new(0),
            events_unrouted: AtomicU64::new(0),
            checkpoint_lag: AtomicU64::new(0),
        })
    }

    pub fn record_captured(&self) {
        self.events_captured.fetch_add(1, Ordering::Relaxed);
        counter!(
            CDCFLOW_EVENTS_CAPTURED_TOTAL,
            SOURCE_ID_LABEL => self.source_id.to_string(),
        )
        .increment(1);
    }

    pub fn record_unrouted(&self) {
        self.events_unrouted.fetch_add(1, Ordering::Relaxed);
        counter!(
            CDCFLOW_EVENTS_UNROUTED_TOTAL,
            SOURCE_ID_LABEL => self.source_id.to_string(),
        )
        .increment(1);
    }

    pub fn set_checkpoint_lag(&self, lag: u64) {
        self.checkpoint_lag.store(lag, Ordering::Relaxed);
        gauge!(
            CDCFLOW_CHECKPOINT_LAG,
            SOURCE_ID_LABEL => self.source_id.to_string(),
        )
        .set(lag as f64);
    }

    pub fn snapshot(&self) -> SourceMetricsSnapshot {
        SourceMetricsSnapshot {
            events_captured: self.events_captured.load(Ordering::Relaxed),
            events_unrouted: self.events_unrouted.load(Ordering::Relaxed),
            checkpoint_lag: self.checkpoint_lag.load(Ordering::Relaxed),
        }
    }
}
