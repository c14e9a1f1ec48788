//! Runtime tunables
//!
//! Plain atomics: no validation beyond the integer range, last writer wins,
//! every operation reads the current value when it starts.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tfs_common::ClientConfig;

macro_rules! tunable {
    ($( $(#[$doc:meta])* $field:ident / $setter:ident ),* $(,)?) => {
        /// Process-wide tunable parameters
        #[derive(Debug)]
        pub struct Tunables {
            $( $field: AtomicI64, )*
        }

        impl Tunables {
            $(
                $(#[$doc])*
                #[must_use]
                pub fn $field(&self) -> i64 {
                    self.$field.load(Ordering::Relaxed)
                }

                pub fn $setter(&self, value: i64) {
                    self.$field.store(value, Ordering::Relaxed);
                }
            )*
        }
    };
}

tunable! {
    /// Resolver cache capacity
    cache_items / set_cache_items,
    /// Resolver cache and idle connection lifetime, seconds
    cache_time / set_cache_time,
    /// Write buffer and large-file segment size, bytes
    segment_size / set_segment_size,
    /// Concurrent segment uploads in large-file mode
    batch_count / set_batch_count,
    /// Statistics reporting interval, milliseconds
    stat_interval / set_stat_interval,
    /// Orphan segment collection interval, milliseconds
    gc_interval / set_gc_interval,
    /// Orphan segment age before removal, milliseconds
    gc_expired_time / set_gc_expired_time,
    /// Upper bound for one batch of segment uploads, milliseconds
    batch_timeout / set_batch_timeout,
    /// Per-attempt request timeout, milliseconds
    wait_timeout / set_wait_timeout,
    /// Total attempts for retryable requests
    client_retry_count / set_client_retry_count,
}

const MIN_SEGMENT_SIZE: usize = 4096;

fn millis(value: i64) -> Option<Duration> {
    u64::try_from(value)
        .ok()
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}

impl Tunables {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            cache_items: AtomicI64::new(config.cache_items),
            cache_time: AtomicI64::new(config.cache_time_secs),
            segment_size: AtomicI64::new(config.segment_size),
            batch_count: AtomicI64::new(config.batch_count),
            stat_interval: AtomicI64::new(config.stat_interval_ms),
            gc_interval: AtomicI64::new(config.gc_interval_ms),
            gc_expired_time: AtomicI64::new(config.gc_expired_time_ms),
            batch_timeout: AtomicI64::new(config.batch_timeout_ms),
            wait_timeout: AtomicI64::new(config.wait_timeout_ms),
            client_retry_count: AtomicI64::new(config.client_retry_count),
        }
    }

    /// Resolver entry and idle connection lifetime; `None` disables caching
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        u64::try_from(self.cache_time())
            .ok()
            .filter(|&s| s > 0)
            .map(Duration::from_secs)
    }

    /// Resolver capacity; zero disables caching
    #[must_use]
    pub fn cache_capacity(&self) -> usize {
        usize::try_from(self.cache_items()).unwrap_or(0)
    }

    /// Per-attempt timeout; `None` waits forever
    #[must_use]
    pub fn attempt_timeout(&self) -> Option<Duration> {
        millis(self.wait_timeout())
    }

    #[must_use]
    pub fn batch_deadline(&self) -> Option<Duration> {
        millis(self.batch_timeout())
    }

    /// Total attempts, at least one
    #[must_use]
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.client_retry_count()).unwrap_or(u32::MAX).max(1)
    }

    /// Segment size in bytes, never below a floor that keeps requests sane
    #[must_use]
    pub fn segment_bytes(&self) -> usize {
        usize::try_from(self.segment_size())
            .unwrap_or(MIN_SEGMENT_SIZE)
            .max(MIN_SEGMENT_SIZE)
    }

    #[must_use]
    pub fn batch_width(&self) -> usize {
        usize::try_from(self.batch_count()).unwrap_or(1).max(1)
    }

    #[must_use]
    pub fn stat_period(&self) -> Option<Duration> {
        millis(self.stat_interval())
    }

    #[must_use]
    pub fn gc_period(&self) -> Option<Duration> {
        millis(self.gc_interval())
    }

    #[must_use]
    pub fn gc_expiry(&self) -> Duration {
        millis(self.gc_expired_time()).unwrap_or(Duration::ZERO)
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let t = Tunables::default();
        t.set_batch_count(17);
        assert_eq!(t.batch_count(), 17);
        t.set_wait_timeout(-5);
        assert_eq!(t.wait_timeout(), -5);
        assert_eq!(t.attempt_timeout(), None);
    }

    #[test]
    fn test_derived_values_are_clamped() {
        let t = Tunables::default();
        t.set_client_retry_count(0);
        assert_eq!(t.attempts(), 1);
        t.set_segment_size(1);
        assert_eq!(t.segment_bytes(), MIN_SEGMENT_SIZE);
        t.set_cache_items(-1);
        assert_eq!(t.cache_capacity(), 0);
        t.set_cache_time(0);
        assert_eq!(t.cache_ttl(), None);
    }
}
