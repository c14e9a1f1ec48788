//! Error types for the TFS client
//!
//! This module defines the common error type used throughout the client,
//! the wire protocol and the reference cluster.

use thiserror::Error;

/// Common result type for TFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for TFS operations
///
/// Errors are `Clone` so a single name-server answer can be shared by every
/// caller waiting on the same lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Lifecycle errors
    #[error("client not initialized")]
    NotInitialized,

    #[error("client already initialized")]
    AlreadyInitialized,

    // Resolve errors
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("block allocation failed: {0}")]
    AllocationFailed(String),

    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(String),

    // Open errors
    #[error("invalid open flags: {0}")]
    InvalidFlags(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("descriptor table exhausted: {max} files open")]
    TableExhausted { max: usize },

    // Transfer errors
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("lease expired: {0}")]
    LeaseExpired(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Close errors
    #[error("invalid file descriptor: {0}")]
    InvalidFd(i32),

    #[error("flush failed: {0}")]
    FlushFailed(String),

    #[error("write aborted by caller")]
    WriteAborted,

    // Unlink errors
    #[error("action conflicts with file state: {0}")]
    StateConflict(String),

    // General errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not permitted on this descriptor: {0}")]
    NotPermitted(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an error by the operation family that raises it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Initialization,
    Resolve,
    Open,
    Io,
    Close,
    Unlink,
    Config,
    Internal,
}

/// Generic failure code returned by the original C client
pub const TFS_ERROR: i32 = 1;
/// Success code returned by the original C client
pub const TFS_SUCCESS: i32 = 0;
/// Code reported for operations on an unknown or closed descriptor
pub const EXIT_INVALIDFD_ERROR: i32 = -1005;

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a transfer error
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Transfer(_)
                | Self::ConnectionFailed(_)
                | Self::ConnectionClosed(_)
                | Self::ClusterUnreachable(_)
        )
    }

    /// Check if this error means the connection it came from is unusable
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ConnectionClosed(_) | Self::ClusterUnreachable(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Get the operation family of this error
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotInitialized | Self::AlreadyInitialized => ErrorCategory::Initialization,

            Self::NotFound(_) | Self::AllocationFailed(_) | Self::ClusterUnreachable(_) => {
                ErrorCategory::Resolve
            }

            Self::InvalidFlags(_) | Self::InvalidFileName(_) | Self::TableExhausted { .. } => {
                ErrorCategory::Open
            }

            Self::Transfer(_)
            | Self::Timeout(_)
            | Self::ConnectionFailed(_)
            | Self::ConnectionClosed(_)
            | Self::LeaseExpired(_)
            | Self::ChecksumMismatch { .. }
            | Self::NotPermitted(_)
            | Self::InvalidArgument(_)
            | Self::Protocol(_)
            | Self::Io(_) => ErrorCategory::Io,

            Self::InvalidFd(_) | Self::FlushFailed(_) | Self::WriteAborted => ErrorCategory::Close,

            Self::StateConflict(_) => ErrorCategory::Unlink,

            Self::Configuration(_) => ErrorCategory::Config,

            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Get the negative status code reported at the numeric boundary
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::NotInitialized => -1001,
            Self::AlreadyInitialized => -1002,
            Self::InvalidFlags(_) => -1003,
            Self::InvalidFileName(_) => -1004,
            Self::InvalidFd(_) => EXIT_INVALIDFD_ERROR,
            Self::TableExhausted { .. } => -1006,
            Self::NotFound(_) => -1007,
            Self::StateConflict(_) => -1008,
            Self::Timeout(_) => -1009,
            Self::ConnectionFailed(_) | Self::ConnectionClosed(_) | Self::ClusterUnreachable(_) => {
                -1010
            }
            Self::LeaseExpired(_) => -1011,
            Self::WriteAborted => -1012,
            Self::FlushFailed(_) => -1013,
            Self::AllocationFailed(_) => -1014,
            Self::NotPermitted(_) => -1015,
            Self::ChecksumMismatch { .. } => -1016,
            Self::InvalidArgument(_) => -1017,
            Self::Transfer(_)
            | Self::Protocol(_)
            | Self::Io(_)
            | Self::Configuration(_)
            | Self::Internal(_) => -TFS_ERROR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout("read".into()).is_retryable());
        assert!(Error::ConnectionClosed("ds-1".into()).is_retryable());
        assert!(!Error::InvalidFd(3).is_retryable());
        assert!(!Error::StateConflict("already deleted".into()).is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("T1abc").is_not_found());
        assert!(!Error::WriteAborted.is_not_found());
    }

    #[test]
    fn test_error_codes_are_negative() {
        let errors = [
            Error::NotInitialized,
            Error::InvalidFd(7),
            Error::Transfer("x".into()),
            Error::TableExhausted { max: 1 },
        ];
        for err in errors {
            assert!(err.code() < 0, "{err} should map to a negative code");
        }
        assert_eq!(Error::InvalidFd(7).code(), EXIT_INVALIDFD_ERROR);
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::InvalidFd(1).category(), ErrorCategory::Close);
        assert_eq!(
            Error::StateConflict("x".into()).category(),
            ErrorCategory::Unlink
        );
        assert_eq!(
            Error::InvalidFlags("x".into()).category(),
            ErrorCategory::Open
        );
    }
}
