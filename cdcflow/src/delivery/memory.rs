use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::bail;
use crate::delivery::client::{EndpointClient, EndpointRequest, EndpointStatus};
use crate::error::{ErrorKind, FlowResult};
use crate::types::IdempotencyKey;

/// Response of a [`MemoryEndpoint`] to one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedResponse {
    Status(u16),
    /// The endpoint cannot be reached.
    Unavailable,
    /// The endpoint never answers.
    Hang,
}

/// A call received by a [`MemoryEndpoint`].
#[derive(Debug, Clone)]
pub struct ReceivedCall {
    pub url: String,
    pub idempotency_key: IdempotencyKey,
    pub payload: serde_json::Value,
    pub received_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    scripted: HashMap<String, VecDeque<ScriptedResponse>>,
    fallback: HashMap<String, ScriptedResponse>,
    calls: Vec<ReceivedCall>,
    /// Keys whose effect was applied, in application order, per url.
    applied: HashMap<String, Vec<(IdempotencyKey, serde_json::Value)>>,
    applied_keys: HashSet<(String, IdempotencyKey)>,
    duplicates: HashMap<String, u64>,
}

/// In-memory endpoint for testing and development purposes.
///
/// Answers `200` unless told otherwise, either with a queue of one-off responses per url or
/// with a response used for every call. Like a well behaved receiver it applies the effect of
/// a successful call at most once per idempotency key and counts the duplicates it discarded.
#[derive(Debug, Clone, Default)]
pub struct MemoryEndpoint {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `responses` for the next calls to `url`.
    pub async fn script(&self, url: &str, responses: impl IntoIterator<Item = ScriptedResponse>) {
        let mut inner = self.inner.lock().await;
        inner
            .scripted
            .entry(url.to_string())
            .or_default()
            .extend(responses);
    }

    /// Answers every unscripted call to `url` with `response`.
    pub async fn respond_always(&self, url: &str, response: ScriptedResponse) {
        let mut inner = self.inner.lock().await;
        inner.fallback.insert(url.to_string(), response);
    }

    /// Goes back to answering `200` to unscripted calls to `url`.
    pub async fn recover(&self, url: &str) {
        let mut inner = self.inner.lock().await;
        inner.fallback.remove(url);
    }

    pub async fn calls(&self) -> Vec<ReceivedCall> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn calls_to(&self, url: &str) -> Vec<ReceivedCall> {
        let inner = self.inner.lock().await;
        inner
            .calls
            .iter()
            .filter(|call| call.url == url)
            .cloned()
            .collect()
    }

    /// Payloads whose effect was applied at `url`, in the order they were first accepted.
    pub async fn applied(&self, url: &str) -> Vec<(IdempotencyKey, serde_json::Value)> {
        let inner = self.inner.lock().await;
        inner.applied.get(url).cloned().unwrap_or_default()
    }

    /// Number of successful calls to `url` that were discarded as already applied.
    pub async fn duplicates(&self, url: &str) -> u64 {
        let inner = self.inner.lock().await;
        inner.duplicates.get(url).copied().unwrap_or_default()
    }
}

impl EndpointClient for MemoryEndpoint {
    async fn send(&self, request: &EndpointRequest) -> FlowResult<EndpointStatus> {
        let response = {
            let mut inner = self.inner.lock().await;
            let scripted = inner
                .scripted
                .get_mut(&request.url)
                .and_then(VecDeque::pop_front);
            let response = scripted
                .or_else(|| inner.fallback.get(&request.url).copied())
                .unwrap_or(ScriptedResponse::Status(200));

            inner.calls.push(ReceivedCall {
                url: request.url.clone(),
                idempotency_key: request.idempotency_key.clone(),
                payload: request.payload.clone(),
                received_at: Instant::now(),
            });

            let succeeded =
                matches!(response, ScriptedResponse::Status(code) if EndpointStatus(code).is_success());
            if succeeded {
                let applied_key = (request.url.clone(), request.idempotency_key.clone());
                if inner.applied_keys.insert(applied_key) {
                    inner
                        .applied
                        .entry(request.url.clone())
                        .or_default()
                        .push((request.idempotency_key.clone(), request.payload.clone()));
                } else {
                    info!(
                        url = %request.url,
                        idempotency_key = %request.idempotency_key,
                        "discarded duplicate delivery"
                    );
                    *inner.duplicates.entry(request.url.clone()).or_default() += 1;
                }
            }

            response
        };

        match response {
            ScriptedResponse::Status(code) => Ok(EndpointStatus(code)),
            ScriptedResponse::Unavailable => bail!(
                ErrorKind::EndpointUnavailable,
                "Endpoint could not be reached",
                format!("endpoint {} is unavailable", request.url)
            ),
            ScriptedResponse::Hang => std::future::pending().await,
        }
    }
}
