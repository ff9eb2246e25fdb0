use std::future::Future;
use std::time::Duration;

use crate::context::RequestContext;
use crate::logging::{get_logger, LogValue};

/// Errors that can tell whether repeating the call may succeed.
pub trait Transient {
    /// True for conditions that indicate the remote side is temporarily
    /// unavailable rather than a business or client error.
    ///
    /// ## Transient (returns true):
    /// - Connection failures (TCP timeout, connection refused, DNS failures)
    /// - Request timeouts
    /// - HTTP 500, 502, 503, 504
    ///
    /// ## Not transient (returns false):
    /// - HTTP 4xx errors
    /// - Malformed responses
    fn is_transient(&self) -> bool;
}

/// Linear backoff: attempt `n` (1-based) waits `backoff * n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// Whether a status code is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

/// Run `request_fn` until it succeeds, fails with a non-transient error, the
/// retry budget is spent or the next wait would outlive the context deadline.
pub async fn execute_with_retry<F, Fut, T, E>(
    ctx: &RequestContext,
    policy: &RetryPolicy,
    operation: &str,
    mut request_fn: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let err = match request_fn().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= policy.max_retries {
            return Err(err);
        }

        attempt += 1;
        let delay = policy.delay(attempt);
        if ctx.remaining().is_some_and(|left| left <= delay) {
            return Err(err);
        }

        get_logger("retry").warnw(
            ctx,
            "retrying after transient failure",
            &[
                ("operation", LogValue::from(operation)),
                ("attempt", LogValue::from(attempt)),
                ("delayMs", LogValue::from(delay.as_millis() as u64)),
                ("cause", LogValue::from(err.to_string())),
            ],
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "transient={}", self.transient)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(5))
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(3));
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));
        assert!(!is_retryable_status(501));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(429));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> =
            execute_with_retry(&RequestContext::new(), &policy(2), "test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError { transient: true })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> =
            execute_with_retry(&RequestContext::new(), &policy(1), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { transient: true })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_business_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> =
            execute_with_retry(&RequestContext::new(), &policy(5), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { transient: false })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stops_before_deadline() {
        let calls = AtomicU32::new(0);
        let ctx = RequestContext::new().with_deadline(Instant::now() + Duration::from_millis(2));
        let slow = RetryPolicy::new(5, Duration::from_secs(1));

        let result: Result<(), TestError> = execute_with_retry(&ctx, &slow, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError { transient: true })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
