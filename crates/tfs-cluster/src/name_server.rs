//! In-memory name server

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use tfs_common::{BlockId, Result};
use tfs_proto::{
    ApplyLeaseRequest, BlockLocation, ClusterInfo, CreateFileRequest, Lease, NameService, NewFile,
};

use crate::faults::Faults;
use crate::store::ClusterStore;

/// Calls received by a name server
#[derive(Debug, Default)]
pub struct NameCounters {
    pub cluster_info: AtomicU64,
    pub get_block: AtomicU64,
    pub create_file: AtomicU64,
    pub apply_lease: AtomicU64,
    pub release_lease: AtomicU64,
}

/// Name server backed by a [`ClusterStore`]
pub struct MemoryNameServer {
    addr: String,
    store: Arc<ClusterStore>,
    counters: NameCounters,
    faults: Faults,
}

impl MemoryNameServer {
    #[must_use]
    pub fn new(addr: impl Into<String>, store: Arc<ClusterStore>) -> Self {
        Self {
            addr: addr.into(),
            store,
            counters: NameCounters::default(),
            faults: Faults::default(),
        }
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[must_use]
    pub const fn counters(&self) -> &NameCounters {
        &self.counters
    }

    #[must_use]
    pub const fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Number of `GetBlock` calls served so far
    #[must_use]
    pub fn get_block_calls(&self) -> u64 {
        self.counters.get_block.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn create_calls(&self) -> u64 {
        self.counters.create_file.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NameService for MemoryNameServer {
    async fn cluster_info(&self) -> Result<ClusterInfo> {
        self.counters.cluster_info.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        Ok(self.store.cluster_info())
    }

    async fn get_block(&self, block_id: BlockId) -> Result<BlockLocation> {
        self.counters.get_block.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        debug!(ns = %self.addr, %block_id, "get block");
        self.store.get_block(block_id)
    }

    async fn create_file(&self, req: CreateFileRequest) -> Result<NewFile> {
        self.counters.create_file.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        let result = self.store.create_file(&req);
        self.faults.after(&self.addr, result)
    }

    async fn apply_lease(&self, req: ApplyLeaseRequest) -> Result<Lease> {
        self.counters.apply_lease.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        self.store.apply_lease(&req)
    }

    async fn release_lease(&self, lease_id: u64) -> Result<()> {
        self.counters.release_lease.fetch_add(1, Ordering::SeqCst);
        self.faults.before(&self.addr).await?;
        self.store.release_lease(lease_id);
        Ok(())
    }
}
