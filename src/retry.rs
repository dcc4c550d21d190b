//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Runs `op` up to `attempts` times, sleeping `base_delay` after the
/// first failure and doubling the delay after each subsequent one.
///
/// Returns the first success, or the last error once all attempts are
/// spent. Retries are opaque to the closure.
pub async fn retry_exponential_backoff<F, Fut, T>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut last_err = None;

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::debug!(attempt, error = %err, "attempt failed");
                last_err = Some(err);
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Config("retry with zero attempts".to_string())))
}
