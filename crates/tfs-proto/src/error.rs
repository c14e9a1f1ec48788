use thiserror::Error;

/// Errors raised while framing or decoding wire messages
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The peer closed the connection between frames.
    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame checksum did not match the payload.
    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<ProtoError> for tfs_common::Error {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Closed => Self::ConnectionClosed("peer closed the connection".into()),
            ProtoError::Io(e) => Self::ConnectionClosed(e.to_string()),
            // A corrupted frame is worth another attempt
            e @ ProtoError::ChecksumMismatch { .. } => Self::Transfer(e.to_string()),
            e @ (ProtoError::TooLarge { .. } | ProtoError::Encode(_) | ProtoError::Decode(_)) => {
                Self::Protocol(e.to_string())
            }
        }
    }
}
