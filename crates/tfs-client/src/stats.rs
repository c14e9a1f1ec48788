//! Client statistics
//!
//! Counters are bumped on the hot path and reported periodically by the
//! maintenance task.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-operation counters
#[derive(Debug, Default)]
pub struct ClientStats {
    pub opens: AtomicU64,
    pub closes: AtomicU64,
    pub reads: AtomicU64,
    pub read_bytes: AtomicU64,
    pub writes: AtomicU64,
    pub write_bytes: AtomicU64,
    pub stats: AtomicU64,
    pub unlinks: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    /// Resolver cache hits
    pub cache_hits: AtomicU64,
    /// Resolver cache misses
    pub cache_misses: AtomicU64,
    pub gc_removed: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub opens: u64,
    pub closes: u64,
    pub reads: u64,
    pub read_bytes: u64,
    pub writes: u64,
    pub write_bytes: u64,
    pub stats: u64,
    pub unlinks: u64,
    pub retries: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub gc_removed: u64,
}

impl ClientStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Calculate resolver hit ratio (0.0 to 1.0)
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            opens: get(&self.opens),
            closes: get(&self.closes),
            reads: get(&self.reads),
            read_bytes: get(&self.read_bytes),
            writes: get(&self.writes),
            write_bytes: get(&self.write_bytes),
            stats: get(&self.stats),
            unlinks: get(&self.unlinks),
            retries: get(&self.retries),
            failures: get(&self.failures),
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            gc_removed: get(&self.gc_removed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let stats = ClientStats::default();
        assert!(stats.hit_ratio().abs() < f64::EPSILON);

        ClientStats::add(&stats.cache_hits, 3);
        ClientStats::incr(&stats.cache_misses);
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.snapshot().cache_hits, 3);
    }
}
