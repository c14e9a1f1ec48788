//! Retry with per-attempt timeout

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use tfs_common::{Error, Result};

use crate::stats::ClientStats;
use crate::tunables::Tunables;

/// Whether a request may be sent more than once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Idempotent requests (reads, stats, lookups) and leased requests whose
    /// `(lease_id, seq)` lets the server drop duplicates
    Retry,
    /// Requests that must not be repeated: unleased writes, file creation
    Once,
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(10u64 << attempt.min(6))
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempt budget from `client_retry_count` is spent. Each attempt is bounded
/// by `wait_timeout`.
///
/// `f` receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(
    tunables: &Tunables,
    stats: &ClientStats,
    op: &str,
    policy: RetryPolicy,
    mut f: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = match policy {
        RetryPolicy::Retry => tunables.attempts(),
        RetryPolicy::Once => 1,
    };

    let mut attempt = 0;
    loop {
        let fut = f(attempt);
        let result = match tunables.attempt_timeout() {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(format!("{op} exceeded {limit:?}")))),
            None => fut.await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                ClientStats::incr(&stats.retries);
                warn!(
                    "{} failed (attempt {}/{}), retrying: {}",
                    op,
                    attempt + 1,
                    attempts,
                    e
                );
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                ClientStats::incr(&stats.failures);
                debug!("{} failed after {} attempt(s): {}", op, attempt + 1, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let tunables = Tunables::default();
        tunables.set_client_retry_count(3);
        let stats = ClientStats::default();
        let calls = &AtomicU32::new(0);

        let value = with_retry(&tunables, &stats, "read", RetryPolicy::Retry, move |_| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::ConnectionClosed("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_total() {
        let tunables = Tunables::default();
        tunables.set_client_retry_count(2);
        let stats = ClientStats::default();
        let calls = &AtomicU32::new(0);

        let err = with_retry(&tunables, &stats, "read", RetryPolicy::Retry, move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::ConnectionClosed("reset".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ConnectionClosed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_once_and_non_retryable() {
        let tunables = Tunables::default();
        let stats = ClientStats::default();
        let calls = &AtomicU32::new(0);

        let _ = with_retry(&tunables, &stats, "write", RetryPolicy::Once, move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Timeout("slow".into()))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _ = with_retry(&tunables, &stats, "stat", RetryPolicy::Retry, move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::not_found("x"))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let tunables = Tunables::default();
        tunables.set_wait_timeout(20);
        tunables.set_client_retry_count(1);
        let stats = ClientStats::default();

        let err = with_retry(&tunables, &stats, "read", RetryPolicy::Retry, move |_| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
