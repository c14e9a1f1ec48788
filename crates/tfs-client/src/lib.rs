//! TFS Client - native client for the TFS distributed small-file store
//!
//! The client resolves file names to block locations through a cluster's
//! name server, talks to the data servers holding the block, and hands out
//! POSIX-like descriptors for reading and writing. Files above the segment
//! size can be written in large-file mode, which splits them into segments
//! tied together by an index file.
//!
//! ```no_run
//! use tfs_client::{TcpConnector, TfsClient};
//! use tfs_common::{ClientConfig, OpenFlags};
//! use std::sync::Arc;
//!
//! # async fn demo() -> tfs_common::Result<()> {
//! let client = TfsClient::initialize(ClientConfig::default(), Arc::new(TcpConnector)).await?;
//! let fd = client.open("", ".jpg", OpenFlags::CREATE | OpenFlags::WRITE, None).await?;
//! client.write(fd, b"image bytes").await?;
//! let name = client.close(fd).await?;
//! # let _ = name;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod client;
mod dispatch;
pub mod fd_table;
pub mod file;
mod gc;
pub mod global;
pub mod io;
pub mod large;
pub mod logging;
mod maintenance;
pub mod pool;
pub mod remote;
pub mod resolver;
pub mod retry;
pub mod stats;
pub mod tunables;

// Re-exports
pub use blocking::BlockingClient;
pub use client::TfsClient;
pub use fd_table::Fd;
pub use remote::TcpConnector;
pub use stats::{ClientStats, StatsSnapshot};
pub use tunables::Tunables;
