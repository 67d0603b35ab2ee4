//! Bounded retry with exponential backoff.
//!
//! Used for two very different resources: remote model calls (HTTP 429 /
//! 503 are transient under concurrent load) and OS-level releases such as
//! deleting a temporary file that a just-exited converter process still
//! holds open. Both want the same schedule: `initial * 2^attempt`, a fixed
//! number of retries, and a predicate deciding which errors are worth
//! retrying at all.

use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Retry schedule: `max_retries` extra attempts after the first, waiting
/// `initial_delay_ms`, then twice that, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
}

impl Backoff {
    pub fn new(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor))
    }
}

/// Run `op` until it succeeds, the error is not transient, or the retry
/// budget is spent. Returns the last error on failure.
pub async fn retry_async<T, E, F, Fut, P>(
    backoff: Backoff,
    label: &str,
    mut op: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < backoff.max_retries && is_transient(&e) => {
                attempt += 1;
                let delay = backoff.delay_for(attempt);
                warn!(
                    "{}: {} — retry {}/{} after {}ms",
                    label,
                    e,
                    attempt,
                    backoff.max_retries,
                    delay.as_millis()
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether an I/O error means "still held by someone, try again shortly".
pub fn is_lock_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ResourceBusy | ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles() {
        let b = Backoff::new(3, 100);
        assert_eq!(b.delay_for(1), Duration::from_millis(100));
        assert_eq!(b.delay_for(2), Duration::from_millis(200));
        assert_eq!(b.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = tokio_test::block_on(retry_async(
            Backoff::new(3, 1),
            "flaky",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("busy {n}"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        ));
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stops_at_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = tokio_test::block_on(retry_async(
            Backoff::new(2, 1),
            "always-busy",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("busy".to_string()) }
            },
            |_| true,
        ));
        assert_eq!(result, Err("busy".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), std::io::Error> = tokio_test::block_on(retry_async(
            Backoff::new(5, 1),
            "gone",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(std::io::Error::from(std::io::ErrorKind::InvalidData)) }
            },
            is_lock_error,
        ));
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_errors_are_transient() {
        assert!(is_lock_error(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
        assert!(!is_lock_error(&std::io::Error::from(
            std::io::ErrorKind::NotFound
        )));
    }
}
