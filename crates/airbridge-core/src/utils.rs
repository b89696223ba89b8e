/*!
 * Utility functions and helpers for AirBridge.
 *
 * This module provides common utilities used throughout the AirBridge crates.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration))),
    }
}

/// Compute the delay before a retry attempt using capped exponential backoff
///
/// Attempt `1` waits `base`, each further attempt doubles the delay, and the
/// result never exceeds `cap`.
pub fn exponential_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(attempt - 1);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_timeout_success() {
        let result = tokio_test::block_on(with_timeout(Duration::from_secs(1), async {
            Ok::<_, Error>(42)
        }));
        assert_eq!(result.unwrap(), 42);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_exponential_backoff() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);

        assert_eq!(exponential_backoff(base, cap, 0), Duration::ZERO);
        assert_eq!(exponential_backoff(base, cap, 1), Duration::from_secs(1));
        assert_eq!(exponential_backoff(base, cap, 2), Duration::from_secs(2));
        assert_eq!(exponential_backoff(base, cap, 4), Duration::from_secs(8));
        assert_eq!(exponential_backoff(base, cap, 7), Duration::from_secs(60));
        assert_eq!(exponential_backoff(base, cap, 64), Duration::from_secs(60));
    }
}
