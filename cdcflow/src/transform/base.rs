use std::fmt;

use async_trait::async_trait;

use crate::error::FlowResult;
use crate::types::ChangeEventEnvelope;

/// Turns a change into the payload delivered to a workflow's endpoint.
///
/// Implementations may be called concurrently and more than once for the same change. They
/// are invoked on their own task under a deadline, so a panic or a hang only fails the
/// invocation.
#[async_trait]
pub trait Transformer: Send + Sync + fmt::Debug {
    async fn transform(&self, event: &ChangeEventEnvelope) -> FlowResult<serde_json::Value>;
}

/// Delivers the versioned change envelope as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTransformer;

#[async_trait]
impl Transformer for PassthroughTransformer {
    async fn transform(&self, event: &ChangeEventEnvelope) -> FlowResult<serde_json::Value> {
        Ok(serde_json::to_value(event)?)
    }
}

/// Adapts a synchronous closure into a [`Transformer`].
pub struct FnTransformer<F> {
    name: &'static str,
    function: F,
}

impl<F> FnTransformer<F>
where
    F: Fn(&ChangeEventEnvelope) -> FlowResult<serde_json::Value> + Send + Sync,
{
    pub fn new(name: &'static str, function: F) -> Self {
        Self { name, function }
    }
}

impl<F> fmt::Debug for FnTransformer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransformer")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> Transformer for FnTransformer<F>
where
    F: Fn(&ChangeEventEnvelope) -> FlowResult<serde_json::Value> + Send + Sync,
{
    async fn transform(&self, event: &ChangeEventEnvelope) -> FlowResult<serde_json::Value> {
        (self.function)(event)
    }
}
