use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::bail;
use crate::error::{ErrorKind, FlowResult};
use crate::transform::Transformer;
use crate::types::{ChangeEventEnvelope, SequenceToken};

/// Transformer failing its first `failures` invocations, then passing the envelope through.
///
/// Clones share the invocation counter.
#[derive(Debug, Clone)]
pub struct ScriptedTransformer {
    failures: u64,
    calls: Arc<AtomicU64>,
}

impl ScriptedTransformer {
    pub fn failing_first(failures: u64) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Transformer that never succeeds.
    pub fn always_failing() -> Self {
        Self::failing_first(u64::MAX)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transformer for ScriptedTransformer {
    async fn transform(&self, event: &ChangeEventEnvelope) -> FlowResult<serde_json::Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            bail!(
                ErrorKind::TransformFailed,
                "Scripted transformer failure",
                format!("call {call} for token {}", event.sequence_token)
            );
        }

        Ok(serde_json::to_value(event)?)
    }
}

/// Transformer that never returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct HangingTransformer;

#[async_trait]
impl Transformer for HangingTransformer {
    async fn transform(&self, _event: &ChangeEventEnvelope) -> FlowResult<serde_json::Value> {
        std::future::pending().await
    }
}

/// Passthrough transformer holding back the changes with the given tokens until
/// [`GatedTransformer::open`] is called.
///
/// Clones share the gate and the counter of held changes.
#[derive(Debug, Clone)]
pub struct GatedTransformer {
    held: Arc<HashSet<SequenceToken>>,
    gate: Arc<watch::Sender<bool>>,
    waiting: Arc<AtomicU64>,
}

impl GatedTransformer {
    pub fn holding(tokens: &[u64]) -> Self {
        let (gate, _) = watch::channel(false);

        Self {
            held: Arc::new(tokens.iter().copied().map(SequenceToken::new).collect()),
            gate: Arc::new(gate),
            waiting: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Lets every held change through, the ones arriving later included.
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Number of invocations that reached the closed gate.
    pub fn waiting(&self) -> u64 {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transformer for GatedTransformer {
    async fn transform(&self, event: &ChangeEventEnvelope) -> FlowResult<serde_json::Value> {
        if self.held.contains(&event.sequence_token) && !*self.gate.borrow() {
            self.waiting.fetch_add(1, Ordering::SeqCst);

            let mut gate = self.gate.subscribe();
            if gate.wait_for(|open| *open).await.is_err() {
                bail!(ErrorKind::InvalidState, "Transformer gate was dropped");
            }
        }

        Ok(serde_json::to_value(event)?)
    }
}
