//! Data-server requests
//!
//! Every request goes through [`with_retry`]. Read-class requests rotate
//! through the block's replicas on each attempt; write-class requests always
//! go to the primary and are only retried when they carry a lease sequence
//! the server can deduplicate.

use std::future::Future;
use std::sync::Arc;

use tfs_common::{Result, UnlinkType};
use tfs_proto::{
    CommitRequest, DataService, FileInfo, ReadRequest, ReadResponse, StatRequest, UnlinkRequest,
    WriteRequest,
};

use crate::pool::ConnectionCache;
use crate::resolver::Location;
use crate::retry::{RetryPolicy, with_retry};
use crate::stats::ClientStats;
use crate::tunables::Tunables;

/// A write lease and the sequence number of one request under it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequenced {
    pub lease_id: u64,
    pub seq: u64,
}

/// Lease held by a write-mode descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHandle {
    pub lease_id: u64,
    next_seq: u64,
}

impl LeaseHandle {
    #[must_use]
    pub const fn new(lease_id: u64) -> Self {
        Self {
            lease_id,
            next_seq: 1,
        }
    }

    /// Sequence number for the next request; retries reuse it
    pub const fn next(&mut self) -> Sequenced {
        let seq = self.next_seq;
        self.next_seq += 1;
        Sequenced {
            lease_id: self.lease_id,
            seq,
        }
    }
}

fn policy_for(lease: Option<Sequenced>) -> RetryPolicy {
    if lease.is_some() {
        RetryPolicy::Retry
    } else {
        RetryPolicy::Once
    }
}

/// Which server a request may be sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Primary,
    AnyReplica,
}

/// Requests against the data servers holding a block
pub struct DataPath {
    pool: Arc<ConnectionCache>,
    tunables: Arc<Tunables>,
    stats: Arc<ClientStats>,
}

impl DataPath {
    pub const fn new(
        pool: Arc<ConnectionCache>,
        tunables: Arc<Tunables>,
        stats: Arc<ClientStats>,
    ) -> Self {
        Self {
            pool,
            tunables,
            stats,
        }
    }

    async fn call<T, F, Fut>(
        &self,
        location: &Location,
        op: &str,
        target: Target,
        policy: RetryPolicy,
        f: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn DataService>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let f = &f;
        with_retry(&self.tunables, &self.stats, op, policy, move |attempt| async move {
            let addr = match target {
                Target::Primary => location.server(0),
                Target::AnyReplica => location.server(attempt),
            };
            let ds = self.pool.data(addr).await?;
            let result = f(ds).await;
            if let Err(e) = &result
                && e.is_connection_error()
            {
                self.pool.invalidate(addr);
            }
            result
        })
        .await
    }

    /// Read up to `length` bytes at `offset`. `lease` reads the contents
    /// staged under a write lease.
    pub async fn read(
        &self,
        location: &Location,
        offset: u64,
        length: u32,
        force: bool,
        lease: Option<u64>,
    ) -> Result<ReadResponse> {
        let req = ReadRequest {
            block_id: location.block_id(),
            file_id: location.file_id(),
            offset,
            length,
            force,
            lease_id: lease,
        };
        let req = &req;
        // Staged data lives on the primary only
        let target = if lease.is_some() {
            Target::Primary
        } else {
            Target::AnyReplica
        };
        self.call(location, "read", target, RetryPolicy::Retry, |ds| async move {
            ds.read(req.clone()).await
        })
        .await
    }

    pub async fn write(
        &self,
        location: &Location,
        lease: Option<Sequenced>,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<u64> {
        let req = WriteRequest {
            block_id: location.block_id(),
            file_id: location.file_id(),
            lease_id: lease.map(|l| l.lease_id),
            seq: lease.map_or(0, |l| l.seq),
            offset,
            data,
        };
        let req = &req;
        self.call(location, "write", Target::Primary, policy_for(lease), |ds| async move {
            ds.write(req.clone()).await
        })
        .await
    }

    pub async fn commit(
        &self,
        location: &Location,
        lease: Option<Sequenced>,
        size: u64,
        crc: Option<u32>,
        sync_log: bool,
    ) -> Result<FileInfo> {
        let req = CommitRequest {
            block_id: location.block_id(),
            file_id: location.file_id(),
            lease_id: lease.map(|l| l.lease_id),
            seq: lease.map_or(0, |l| l.seq),
            size,
            crc,
            sync_log,
        };
        let req = &req;
        // An unleased commit only sets the size, so repeating it is harmless
        self.call(location, "commit", Target::Primary, RetryPolicy::Retry, |ds| async move {
            ds.commit(req.clone()).await
        })
        .await
    }

    pub async fn stat(
        &self,
        location: &Location,
        force: bool,
        lease: Option<u64>,
    ) -> Result<FileInfo> {
        let req = StatRequest {
            block_id: location.block_id(),
            file_id: location.file_id(),
            force,
            lease_id: lease,
        };
        let req = &req;
        let target = if lease.is_some() {
            Target::Primary
        } else {
            Target::AnyReplica
        };
        self.call(location, "stat", target, RetryPolicy::Retry, |ds| async move {
            ds.stat(req.clone()).await
        })
        .await
    }

    pub async fn unlink(
        &self,
        location: &Location,
        action: UnlinkType,
        lease: Option<Sequenced>,
    ) -> Result<FileInfo> {
        let req = UnlinkRequest {
            block_id: location.block_id(),
            file_id: location.file_id(),
            action: action.raw(),
            lease_id: lease.map(|l| l.lease_id),
            seq: lease.map_or(0, |l| l.seq),
        };
        let req = &req;
        self.call(location, "unlink", Target::Primary, policy_for(lease), |ds| async move {
            ds.unlink(req.clone()).await
        })
        .await
    }
}
