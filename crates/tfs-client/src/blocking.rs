//! Blocking facade
//!
//! For callers without an async runtime. The facade owns a multi-threaded
//! runtime and blocks on each call, so it must not be used from inside
//! another runtime's worker thread.

use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;

use tfs_common::{
    ClientConfig, Error, OpenFlags, OptionFlag, Result, SeekWhence, StatMode, TfsFileStat,
    UnlinkType,
};
use tfs_proto::Connector;

use crate::client::TfsClient;
use crate::fd_table::Fd;
use crate::remote::TcpConnector;

pub struct BlockingClient {
    runtime: Runtime,
    client: Arc<TfsClient>,
}

impl BlockingClient {
    /// Start a runtime and initialize a client over TCP
    pub fn initialize(config: ClientConfig) -> Result<Self> {
        Self::initialize_with(config, Arc::new(TcpConnector))
    }

    pub fn initialize_with(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tfs-client")
            .enable_all()
            .build()
            .map_err(|e| Error::internal(format!("starting runtime: {e}")))?;
        let client = runtime.block_on(TfsClient::initialize(config, connector))?;
        Ok(Self { runtime, client })
    }

    /// The async client behind the facade
    #[must_use]
    pub fn client(&self) -> &Arc<TfsClient> {
        &self.client
    }

    pub fn open(
        &self,
        name: &str,
        suffix: &str,
        flags: OpenFlags,
        local_key: Option<&Path>,
    ) -> Result<Fd> {
        self.runtime
            .block_on(self.client.open(name, suffix, flags, local_key))
    }

    pub fn close(&self, fd: Fd) -> Result<String> {
        self.runtime.block_on(self.client.close(fd))
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.runtime.block_on(self.client.read(fd, buf))
    }

    pub fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.runtime.block_on(self.client.pread(fd, buf, offset))
    }

    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        self.runtime.block_on(self.client.write(fd, data))
    }

    pub fn pwrite(&self, fd: Fd, data: &[u8], offset: u64) -> Result<usize> {
        self.runtime.block_on(self.client.pwrite(fd, data, offset))
    }

    pub fn seek(&self, fd: Fd, offset: i64, whence: SeekWhence) -> Result<u64> {
        self.runtime.block_on(self.client.seek(fd, offset, whence))
    }

    pub fn fstat(&self, fd: Fd, mode: StatMode) -> Result<TfsFileStat> {
        self.runtime.block_on(self.client.fstat(fd, mode))
    }

    pub fn set_option_flag(&self, fd: Fd, flag: OptionFlag) -> Result<()> {
        self.runtime.block_on(self.client.set_option_flag(fd, flag))
    }

    pub fn unlink(&self, name: &str, suffix: &str, action: UnlinkType) -> Result<i64> {
        self.runtime
            .block_on(self.client.unlink(name, suffix, action))
    }

    /// Store `data` as a new small file and return its name
    pub fn save_file(&self, data: &[u8], suffix: &str) -> Result<String> {
        self.runtime.block_on(async {
            let fd = self
                .client
                .open("", suffix, OpenFlags::CREATE | OpenFlags::WRITE, None)
                .await?;
            if let Err(e) = self.client.write(fd, data).await {
                let _ = self
                    .client
                    .set_option_flag(fd, OptionFlag::CloseFlagWriteDataFailed)
                    .await;
                let _ = self.client.close(fd).await;
                return Err(e);
            }
            self.client.close(fd).await
        })
    }

    /// Read a whole file
    pub fn fetch_file(&self, name: &str, suffix: &str) -> Result<Vec<u8>> {
        self.runtime.block_on(async {
            let fd = self
                .client
                .open(name, suffix, OpenFlags::READ, None)
                .await?;
            let result = read_to_end(&self.client, fd).await;
            let _ = self.client.close(fd).await;
            result
        })
    }

    pub fn destroy(self) -> Result<()> {
        self.runtime.block_on(self.client.destroy())
    }
}

async fn read_to_end(client: &TfsClient, fd: Fd) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = client.read(fd, &mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}
