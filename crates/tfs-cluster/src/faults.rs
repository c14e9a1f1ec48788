//! Fault injection for exercising client retry paths

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tfs_common::{Error, Result};

/// Faults applied to the requests a server receives
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail this many upcoming requests before they are applied
    fail_before: AtomicU32,
    /// Apply this many upcoming requests, then drop their replies
    fail_after: AtomicU32,
    /// Refuse this many upcoming requests with a non-retryable error
    reject: AtomicU32,
    /// Added latency per request in milliseconds
    delay_ms: AtomicU64,
    /// Refuse every request
    unreachable: AtomicBool,
}

impl Faults {
    pub fn fail_next(&self, n: u32) {
        self.fail_before.store(n, Ordering::SeqCst);
    }

    /// Simulate lost replies: the request takes effect but the caller sees a
    /// connection error.
    pub fn drop_replies(&self, n: u32) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// Refuse upcoming requests outright, as a server enforcing a policy would
    pub fn reject_next(&self, n: u32) {
        self.reject.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.fail_before.store(0, Ordering::SeqCst);
        self.fail_after.store(0, Ordering::SeqCst);
        self.reject.store(0, Ordering::SeqCst);
        self.delay_ms.store(0, Ordering::SeqCst);
        self.unreachable.store(false, Ordering::SeqCst);
    }

    /// Run before handling a request
    pub async fn before(&self, server: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed(format!("{server} unreachable")));
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take_one(&self.fail_before) {
            return Err(Error::ConnectionClosed(format!("{server} reset the connection")));
        }
        if take_one(&self.reject) {
            return Err(Error::NotPermitted(format!("{server} refused the request")));
        }
        Ok(())
    }

    /// Run after a request was applied
    pub fn after<T>(&self, server: &str, result: Result<T>) -> Result<T> {
        if result.is_ok() && take_one(&self.fail_after) {
            return Err(Error::ConnectionClosed(format!("{server} reply lost")));
        }
        result
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
