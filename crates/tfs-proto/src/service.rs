//! Service traits
//!
//! The client talks to both servers through these traits. The remote
//! transport implements them over TCP; the reference cluster implements them
//! in memory and exposes them over TCP through [`dispatch`].

use async_trait::async_trait;
use std::sync::Arc;

use tfs_common::{BlockId, Error, Result};

use crate::messages::{
    ApplyLeaseRequest, BlockLocation, ClusterInfo, CommitRequest, CreateFileRequest, DataRequest,
    FileInfo, Lease, NameRequest, NewFile, ReadRequest, ReadResponse, Reply, Request, Response,
    StatRequest, Status, UnlinkRequest, WriteRequest,
};

/// Name server operations: cluster identity, block lookup and leases
#[async_trait]
pub trait NameService: Send + Sync {
    async fn cluster_info(&self) -> Result<ClusterInfo>;

    async fn get_block(&self, block_id: BlockId) -> Result<BlockLocation>;

    /// Allocate a new file and grant a write lease on it.
    async fn create_file(&self, req: CreateFileRequest) -> Result<NewFile>;

    /// Grant a write lease on an existing file.
    async fn apply_lease(&self, req: ApplyLeaseRequest) -> Result<Lease>;

    /// Drop a lease; uncommitted data staged under it is discarded.
    async fn release_lease(&self, lease_id: u64) -> Result<()>;
}

/// Data server operations
#[async_trait]
pub trait DataService: Send + Sync {
    async fn read(&self, req: ReadRequest) -> Result<ReadResponse>;

    /// Returns the number of bytes accepted.
    async fn write(&self, req: WriteRequest) -> Result<u64>;

    async fn commit(&self, req: CommitRequest) -> Result<FileInfo>;

    async fn stat(&self, req: StatRequest) -> Result<FileInfo>;

    /// Returns the file info after the state change.
    async fn unlink(&self, req: UnlinkRequest) -> Result<FileInfo>;
}

/// Opens service handles for addresses
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_name(&self, addr: &str) -> Result<Arc<dyn NameService>>;

    async fn connect_data(&self, addr: &str) -> Result<Arc<dyn DataService>>;
}

/// Route a decoded request to the matching service.
///
/// A server that does not host the requested service answers with
/// `InvalidArgument`.
pub async fn dispatch(
    name: Option<&dyn NameService>,
    data: Option<&dyn DataService>,
    req: Request,
) -> Response {
    let result = match req {
        Request::Name(req) => match name {
            Some(name) => dispatch_name(name, req).await,
            None => Err(Error::invalid_argument("no name service on this endpoint")),
        },
        Request::Data(req) => match data {
            Some(data) => dispatch_data(data, req).await,
            None => Err(Error::invalid_argument("no data service on this endpoint")),
        },
    };
    result.map_err(|e| Status::from(&e))
}

async fn dispatch_name(svc: &dyn NameService, req: NameRequest) -> Result<Reply> {
    Ok(match req {
        NameRequest::ClusterInfo => Reply::ClusterInfo(svc.cluster_info().await?),
        NameRequest::GetBlock(block_id) => Reply::Block(svc.get_block(block_id).await?),
        NameRequest::CreateFile(req) => Reply::NewFile(svc.create_file(req).await?),
        NameRequest::ApplyLease(req) => Reply::Lease(svc.apply_lease(req).await?),
        NameRequest::ReleaseLease(lease_id) => {
            svc.release_lease(lease_id).await?;
            Reply::Released
        }
    })
}

async fn dispatch_data(svc: &dyn DataService, req: DataRequest) -> Result<Reply> {
    Ok(match req {
        DataRequest::Read(req) => Reply::Read(svc.read(req).await?),
        DataRequest::Write(req) => Reply::Written(svc.write(req).await?),
        DataRequest::Commit(req) => Reply::Info(svc.commit(req).await?),
        DataRequest::Stat(req) => Reply::Info(svc.stat(req).await?),
        DataRequest::Unlink(req) => Reply::Info(svc.unlink(req).await?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StatusCode;

    struct FixedName;

    #[async_trait]
    impl NameService for FixedName {
        async fn cluster_info(&self) -> Result<ClusterInfo> {
            Ok(ClusterInfo {
                cluster_id: 1,
                server_id: 99,
            })
        }

        async fn get_block(&self, block_id: BlockId) -> Result<BlockLocation> {
            Err(Error::not_found(format!("block {block_id}")))
        }

        async fn create_file(&self, _req: CreateFileRequest) -> Result<NewFile> {
            Err(Error::AllocationFailed("full".into()))
        }

        async fn apply_lease(&self, _req: ApplyLeaseRequest) -> Result<Lease> {
            Ok(Lease { lease_id: 1 })
        }

        async fn release_lease(&self, _lease_id: u64) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_name_requests() {
        let svc = FixedName;

        let reply = dispatch(Some(&svc), None, Request::Name(NameRequest::ClusterInfo)).await;
        assert_eq!(
            reply,
            Ok(Reply::ClusterInfo(ClusterInfo {
                cluster_id: 1,
                server_id: 99
            }))
        );

        let reply = dispatch(
            Some(&svc),
            None,
            Request::Name(NameRequest::GetBlock(BlockId(4))),
        )
        .await;
        assert_eq!(reply.unwrap_err().code, StatusCode::NotFound);

        let reply = dispatch(Some(&svc), None, Request::Name(NameRequest::ReleaseLease(1))).await;
        assert_eq!(reply, Ok(Reply::Released));
    }

    #[tokio::test]
    async fn test_dispatch_missing_service() {
        let req = Request::Data(DataRequest::Stat(StatRequest {
            block_id: BlockId(1),
            file_id: tfs_common::FileId(1),
            force: false,
            lease_id: None,
        }));
        let reply = dispatch(Some(&FixedName), None, req).await;
        assert_eq!(reply.unwrap_err().code, StatusCode::InvalidArgument);
    }
}
