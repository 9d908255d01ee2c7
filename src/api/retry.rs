//! Timeout and bounded retry around exchange calls.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use tracing::warn;

use super::ExchangeError;

/// Whether a call may be repeated after an unknown outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    Idempotent,
    /// Placing an order: a timeout may mean it was accepted.
    NonIdempotent,
}

/// Per-call timeout and retry budget.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl CallPolicy {
    /// Run `f` with a timeout per attempt, retrying with exponential backoff.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        idempotency: Idempotency,
        mut f: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build();

        let attempts = AtomicU32::new(0);
        let timeout = self.timeout;
        let max_attempts = self.max_attempts.max(1);

        backoff::future::retry(backoff, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = f();
            async move {
                let outcome = match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ExchangeError::Timeout {
                        operation,
                        after: timeout,
                    }),
                };
                match outcome {
                    Ok(value) => Ok(value),
                    Err(e) if attempt < max_attempts && e.is_retryable(idempotency) => {
                        warn!(operation = operation, attempt = attempt, error = %e, "Exchange call failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn fast_policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(50),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = tokio_test::block_on(fast_policy().call("prices", Idempotency::Idempotent, || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            }
        }));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = tokio_test::block_on(fast_policy().call("balance", Idempotency::Idempotent, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::RateLimited("slow down".into()))
            }
        }));
        assert!(matches!(result, Err(ExchangeError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_idempotent_network_error_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = tokio_test::block_on(fast_policy().call("place", Idempotency::NonIdempotent, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Network("connection dropped".into()))
            }
        }));
        assert!(result.unwrap_err().is_unknown_outcome());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_unknown_outcome() {
        let result: Result<(), _> = fast_policy()
            .call("place", Idempotency::NonIdempotent, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        match result {
            Err(e @ ExchangeError::Timeout { .. }) => assert!(e.is_unknown_outcome()),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
