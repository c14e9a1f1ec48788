//! In-memory data server

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use tfs_common::Result;
use tfs_proto::{
    CommitRequest, DataService, FileInfo, ReadRequest, ReadResponse, StatRequest, UnlinkRequest,
    WriteRequest,
};

use crate::faults::Faults;
use crate::store::ClusterStore;

/// Calls received by a data server
#[derive(Debug, Default)]
pub struct DataCounters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    /// Writes that changed state, replays excluded
    pub applied_writes: AtomicU64,
    pub commits: AtomicU64,
    pub applied_commits: AtomicU64,
    pub stats: AtomicU64,
    pub unlinks: AtomicU64,
    pub applied_unlinks: AtomicU64,
}

impl DataCounters {
    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

/// Data server backed by a [`ClusterStore`]
pub struct MemoryDataServer {
    addr: String,
    store: Arc<ClusterStore>,
    counters: DataCounters,
    faults: Faults,
}

impl MemoryDataServer {
    #[must_use]
    pub fn new(addr: impl Into<String>, store: Arc<ClusterStore>) -> Self {
        Self {
            addr: addr.into(),
            store,
            counters: DataCounters::default(),
            faults: Faults::default(),
        }
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[must_use]
    pub const fn counters(&self) -> &DataCounters {
        &self.counters
    }

    #[must_use]
    pub const fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl DataService for MemoryDataServer {
    async fn read(&self, req: ReadRequest) -> Result<ReadResponse> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        self.store.read(&req)
    }

    async fn write(&self, req: WriteRequest) -> Result<u64> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        let outcome = self.store.write(&req)?;
        if outcome.replayed {
            debug!(ds = %self.addr, lease_id = ?req.lease_id, seq = req.seq, "replayed write");
        } else {
            self.counters.applied_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.faults.after(&self.addr, Ok(outcome.value))
    }

    async fn commit(&self, req: CommitRequest) -> Result<FileInfo> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        let outcome = self.store.commit(&req)?;
        if !outcome.replayed {
            self.counters.applied_commits.fetch_add(1, Ordering::SeqCst);
        }
        self.faults.after(&self.addr, Ok(outcome.value))
    }

    async fn stat(&self, req: StatRequest) -> Result<FileInfo> {
        self.counters.stats.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        self.store.stat(&req)
    }

    async fn unlink(&self, req: UnlinkRequest) -> Result<FileInfo> {
        self.counters.unlinks.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        let outcome = self.store.unlink(&req)?;
        if !outcome.replayed {
            self.counters.applied_unlinks.fetch_add(1, Ordering::SeqCst);
        }
        self.faults.after(&self.addr, Ok(outcome.value))
    }
}
