//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{DeployError, Result};

/// Calls `check` until it yields a value, sleeping `interval` between
/// attempts. Errors from `check` end the loop immediately. Expiry of
/// `limit` is reported as [`DeployError::Timeout`] mentioning `what`.
///
/// Dropping the returned future cancels the loop.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    limit: Duration,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let looped = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Some(value) = check().await? {
                return Ok(value);
            }
            debug!("Waiting for {} (attempt {})", what, attempt);
            sleep(interval).await;
        }
    };

    match timeout(limit, looped).await {
        Ok(result) => result,
        Err(_) => Err(DeployError::Timeout(format!(
            "Timeout after {}s while waiting for {}.",
            limit.as_secs(),
            what
        ))),
    }
}
