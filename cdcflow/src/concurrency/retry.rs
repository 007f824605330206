use std::future::Future;

use tracing::warn;

use crate::concurrency::backoff::Backoff;
use crate::error::FlowResult;
use crate::workers::policy::build_error_handling_policy;

/// Runs `operation` until it succeeds, retrying transient failures following `backoff`.
///
/// Errors that cannot be retried, and the last error once `backoff` is exhausted, are
/// returned as is. `operation` must be safe to repeat, like guarded checkpoint writes.
pub async fn retry_transient<T, F, Fut>(
    backoff: &Backoff,
    description: &'static str,
    mut operation: F,
) -> FlowResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FlowResult<T>>,
{
    let mut failures = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        failures += 1;
        if !build_error_handling_policy(&err).is_retryable() || !backoff.allows_retry(failures) {
            return Err(err);
        }

        let delay = backoff.delay_for(failures);
        warn!(
            operation = description,
            attempt = failures,
            max_attempts = backoff.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err.summary(),
            "operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
