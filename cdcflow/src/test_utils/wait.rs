use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

/// Default bound for [`wait_for`].
///
/// Tests run with paused time auto advance through it quickly, it only matters when the
/// condition is never reached.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between two evaluations of the condition.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics with `description` when the condition does not hold within
/// [`DEFAULT_WAIT_TIMEOUT`].
pub async fn wait_for<F, Fut>(description: &str, condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for_with_timeout(description, DEFAULT_WAIT_TIMEOUT, condition).await;
}

/// Same as [`wait_for`] with an explicit bound.
pub async fn wait_for_with_timeout<F, Fut>(description: &str, bound: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !condition().await {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    if timeout(bound, poll).await.is_err() {
        panic!("timed out after {bound:?} waiting for: {description}");
    }
}
