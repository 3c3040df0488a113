//! Exponential backoff for chain-transient failures

use crate::error::RelayerResult;

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// `base * 2^retry_count`, capped at `max`
pub fn backoff_delay(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Retry an async operation while it fails with a retryable error.
///
/// `op` receives the 1-based attempt number. Non-retryable errors are
/// returned immediately, as is the last error once `attempts` is used up.
pub async fn retry_transient<F, Fut, T>(
    mut op: F,
    attempts: u32,
    base: Duration,
    max: Duration,
) -> RelayerResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RelayerResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff_delay(attempt - 1, base, max);
                warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::GatewayError;
    use crate::error::RelayerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(800));
        assert_eq!(backoff_delay(4, base, max), max);
        assert_eq!(backoff_delay(200, base, max), max);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(
            |_| {
                let current = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if current < 2 {
                        Err(RelayerError::gateway(
                            "a",
                            GatewayError::Unavailable("down".into()),
                        ))
                    } else {
                        Ok(7)
                    }
                }
            },
            4,
            Duration::from_millis(1),
            Duration::from_millis(4),
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: RelayerResult<()> = retry_transient(
            |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(RelayerError::Validation("bad".into())) }
            },
            5,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
