//! Request and response messages
//!
//! Every request travels as a [`Request`] frame and is answered by exactly
//! one [`Response`] frame.

use serde::{Deserialize, Serialize};
use std::fmt;

use tfs_common::{BlockId, Error, FileId, FileStatus, TfsFileStat};

/// Identity of a cluster as reported by its name server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Digit embedded in every file name created on this cluster
    pub cluster_id: u8,
    pub server_id: u64,
}

/// Where a block lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub block_id: BlockId,
    /// Data server addresses, primary first
    pub servers: Vec<String>,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFileRequest {
    /// The file will hold a large-file segment index
    pub large: bool,
    /// Allocate a fresh block instead of reusing a writable one
    pub new_block: bool,
    pub suffix_hash: u32,
    pub client_id: String,
}

/// A freshly allocated file together with its write lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub servers: Vec<String>,
    pub version: u32,
    pub lease_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyLeaseRequest {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub offset: u64,
    pub length: u32,
    /// Read deleted or concealed files
    pub force: bool,
    /// Read the staged contents of this write lease
    pub lease_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub data: Vec<u8>,
    pub info: FileInfo,
}

/// Data written at `offset`.
///
/// Without a lease the data lands in the stored file directly.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub lease_id: Option<u64>,
    pub seq: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("block_id", &self.block_id)
            .field("file_id", &self.file_id)
            .field("lease_id", &self.lease_id)
            .field("seq", &self.seq)
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Finish a write session: the file becomes exactly `size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub lease_id: Option<u64>,
    pub seq: u64,
    pub size: u64,
    /// Expected CRC32C of the final contents, when the writer knows it
    pub crc: Option<u32>,
    pub sync_log: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRequest {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub force: bool,
    pub lease_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkRequest {
    pub block_id: BlockId,
    pub file_id: FileId,
    /// Raw unlink type, see [`tfs_common::UnlinkType`]
    pub action: i32,
    pub lease_id: Option<u64>,
    pub seq: u64,
}

/// File metadata as stored by a data server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: FileId,
    pub block_offset: i32,
    pub size: u64,
    pub usize: u64,
    pub modify_time: i64,
    pub create_time: i64,
    pub status: FileStatus,
    pub crc: u32,
}

impl FileInfo {
    #[must_use]
    pub fn to_stat(&self) -> TfsFileStat {
        TfsFileStat {
            file_id: self.file_id.0,
            offset: self.block_offset,
            size: i64::try_from(self.size).unwrap_or(i64::MAX),
            usize: i64::try_from(self.usize).unwrap_or(i64::MAX),
            modify_time: self.modify_time,
            create_time: self.create_time,
            flag: self.status.flag_bits(),
            crc: self.crc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameRequest {
    ClusterInfo,
    GetBlock(BlockId),
    CreateFile(CreateFileRequest),
    ApplyLease(ApplyLeaseRequest),
    ReleaseLease(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRequest {
    Read(ReadRequest),
    Write(WriteRequest),
    Commit(CommitRequest),
    Stat(StatRequest),
    Unlink(UnlinkRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Name(NameRequest),
    Data(DataRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    ClusterInfo(ClusterInfo),
    Block(BlockLocation),
    NewFile(NewFile),
    Lease(Lease),
    Released,
    Read(ReadResponse),
    Written(u64),
    Info(FileInfo),
}

impl Reply {
    /// Short name used in protocol errors
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ClusterInfo(_) => "ClusterInfo",
            Self::Block(_) => "Block",
            Self::NewFile(_) => "NewFile",
            Self::Lease(_) => "Lease",
            Self::Released => "Released",
            Self::Read(_) => "Read",
            Self::Written(_) => "Written",
            Self::Info(_) => "Info",
        }
    }
}

pub type Response = Result<Reply, Status>;

/// Error status carried in a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    NotFound,
    InvalidArgument,
    LeaseExpired,
    StateConflict,
    AllocationFailed,
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The server could not reach what it needed; worth another attempt
    Unavailable,
    Internal,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let msg = status.message;
        match status.code {
            StatusCode::NotFound => Self::NotFound(msg),
            StatusCode::InvalidArgument => Self::InvalidArgument(msg),
            StatusCode::LeaseExpired => Self::LeaseExpired(msg),
            StatusCode::StateConflict => Self::StateConflict(msg),
            StatusCode::AllocationFailed => Self::AllocationFailed(msg),
            StatusCode::ChecksumMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
            StatusCode::Unavailable => Self::ConnectionClosed(msg),
            StatusCode::Internal => Self::Internal(msg),
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        let code = match err {
            Error::NotFound(_) => StatusCode::NotFound,
            Error::InvalidArgument(_) | Error::InvalidFileName(_) | Error::InvalidFlags(_) => {
                StatusCode::InvalidArgument
            }
            Error::LeaseExpired(_) => StatusCode::LeaseExpired,
            Error::StateConflict(_) => StatusCode::StateConflict,
            Error::AllocationFailed(_) => StatusCode::AllocationFailed,
            Error::ChecksumMismatch { expected, actual } => StatusCode::ChecksumMismatch {
                expected: *expected,
                actual: *actual,
            },
            Error::ConnectionFailed(_) | Error::ConnectionClosed(_) => StatusCode::Unavailable,
            _ => StatusCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}
