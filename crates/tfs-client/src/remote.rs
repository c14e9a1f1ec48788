//! TCP transport
//!
//! One connection per server address, one request in flight per
//! connection. The stream is opened on first use and dropped on any I/O
//! error so the next request reconnects.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use tfs_common::{BlockId, Error, Result};
use tfs_proto::{
    ApplyLeaseRequest, BlockLocation, ClusterInfo, CommitRequest, Connector, CreateFileRequest,
    DataRequest, DataService, FileInfo, Lease, NameRequest, NameService, NewFile, ReadRequest,
    ReadResponse, Reply, Request, Response, StatRequest, UnlinkRequest, WriteRequest, read_frame,
    write_frame,
};

/// Connects to servers over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect_name(&self, addr: &str) -> Result<Arc<dyn NameService>> {
        let conn = Connection::open(addr).await?;
        Ok(Arc::new(RemoteName(conn)))
    }

    async fn connect_data(&self, addr: &str) -> Result<Arc<dyn DataService>> {
        let conn = Connection::open(addr).await?;
        Ok(Arc::new(RemoteData(conn)))
    }
}

struct Connection {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self> {
        let stream = Self::dial(addr).await?;
        Ok(Self {
            addr: addr.to_string(),
            stream: Mutex::new(Some(stream)),
        })
    }

    async fn dial(addr: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        debug!(addr, "connected");
        Ok(stream)
    }

    /// Send one request and wait for its response
    async fn call(&self, req: Request) -> Result<Reply> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(Self::dial(&self.addr).await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(Error::internal("connection slot empty after dial"));
        };

        let exchanged = async {
            write_frame(&mut *stream, &req).await?;
            read_frame::<_, Response>(&mut *stream).await
        }
        .await;

        match exchanged {
            Ok(response) => response.map_err(Error::from),
            Err(e) => {
                // The stream may hold half a frame; never reuse it
                *guard = None;
                Err(e.into())
            }
        }
    }
}

fn unexpected(op: &str, reply: &Reply) -> Error {
    Error::Protocol(format!("unexpected reply to {op}: {reply:?}"))
}

struct RemoteName(Connection);

#[async_trait]
impl NameService for RemoteName {
    async fn cluster_info(&self) -> Result<ClusterInfo> {
        match self.0.call(Request::Name(NameRequest::ClusterInfo)).await? {
            Reply::ClusterInfo(info) => Ok(info),
            other => Err(unexpected("cluster_info", &other)),
        }
    }

    async fn get_block(&self, block_id: BlockId) -> Result<BlockLocation> {
        match self.0.call(Request::Name(NameRequest::GetBlock(block_id))).await? {
            Reply::Block(block) => Ok(block),
            other => Err(unexpected("get_block", &other)),
        }
    }

    async fn create_file(&self, req: CreateFileRequest) -> Result<NewFile> {
        match self.0.call(Request::Name(NameRequest::CreateFile(req))).await? {
            Reply::NewFile(file) => Ok(file),
            other => Err(unexpected("create_file", &other)),
        }
    }

    async fn apply_lease(&self, req: ApplyLeaseRequest) -> Result<Lease> {
        match self.0.call(Request::Name(NameRequest::ApplyLease(req))).await? {
            Reply::Lease(lease) => Ok(lease),
            other => Err(unexpected("apply_lease", &other)),
        }
    }

    async fn release_lease(&self, lease_id: u64) -> Result<()> {
        match self.0.call(Request::Name(NameRequest::ReleaseLease(lease_id))).await? {
            Reply::Released => Ok(()),
            other => Err(unexpected("release_lease", &other)),
        }
    }
}

struct RemoteData(Connection);

#[async_trait]
impl DataService for RemoteData {
    async fn read(&self, req: ReadRequest) -> Result<ReadResponse> {
        match self.0.call(Request::Data(DataRequest::Read(req))).await? {
            Reply::Read(resp) => Ok(resp),
            other => Err(unexpected("read", &other)),
        }
    }

    async fn write(&self, req: WriteRequest) -> Result<u64> {
        match self.0.call(Request::Data(DataRequest::Write(req))).await? {
            Reply::Written(n) => Ok(n),
            other => Err(unexpected("write", &other)),
        }
    }

    async fn commit(&self, req: CommitRequest) -> Result<FileInfo> {
        match self.0.call(Request::Data(DataRequest::Commit(req))).await? {
            Reply::Info(info) => Ok(info),
            other => Err(unexpected("commit", &other)),
        }
    }

    async fn stat(&self, req: StatRequest) -> Result<FileInfo> {
        match self.0.call(Request::Data(DataRequest::Stat(req))).await? {
            Reply::Info(info) => Ok(info),
            other => Err(unexpected("stat", &other)),
        }
    }

    async fn unlink(&self, req: UnlinkRequest) -> Result<FileInfo> {
        match self.0.call(Request::Data(DataRequest::Unlink(req))).await? {
            Reply::Info(info) => Ok(info),
            other => Err(unexpected("unlink", &other)),
        }
    }
}
