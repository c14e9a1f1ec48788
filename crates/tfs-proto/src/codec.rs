//! Frame codec
//!
//! On-wire format:
//! ```text
//! [checksum: 4 bytes LE][size: 4 bytes LE][payload: `size` bytes]
//! ```
//! The checksum is the CRC32C of the bincode payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum allowed payload size (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Header prepended to every frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub checksum: u32,
    pub size: u32,
}

impl FrameHeader {
    #[must_use]
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            checksum: crc32c::crc32c(payload),
            size: payload.len() as u32,
        }
    }

    #[must_use]
    pub fn from_bytes(data: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let checksum = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Self { checksum, size }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Check the payload against this header.
    pub fn validate(&self, payload: &[u8]) -> Result<(), ProtoError> {
        let actual = crc32c::crc32c(payload);
        if actual != self.checksum {
            return Err(ProtoError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// Serialize `msg` and prepend a frame header.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Bytes, ProtoError> {
    let payload = bincode::serialize(msg).map_err(|e| ProtoError::Encode(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtoError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let header = FrameHeader::for_payload(&payload);
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.put_slice(&header.to_bytes());
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Encode `msg` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode its payload.
///
/// A clean end of stream before the header yields `ProtoError::Closed`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtoError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtoError::Closed),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::from_bytes(&header_bytes);

    let size = header.size as usize;
    if size > MAX_FRAME_SIZE {
        return Err(ProtoError::TooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    header.validate(&payload)?;

    bincode::deserialize(&payload).map_err(|e| ProtoError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DataRequest, NameRequest, Request, StatRequest};
    use tfs_common::{BlockId, FileId};

    #[test]
    fn test_header_from_bytes_le() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let hdr = FrameHeader::from_bytes(&data);
        assert_eq!(hdr.checksum, 0x0403_0201);
        assert_eq!(hdr.size, 0x0807_0605);
        assert_eq!(hdr.to_bytes(), data);
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let first = Request::Name(NameRequest::GetBlock(BlockId(17)));
        let second = Request::Data(DataRequest::Stat(StatRequest {
            block_id: BlockId(17),
            file_id: FileId::new(3, 0),
            force: true,
            lease_id: None,
        }));
        write_frame(&mut client, &first).await.unwrap();
        write_frame(&mut client, &second).await.unwrap();
        drop(client);

        let got: Request = read_frame(&mut server).await.unwrap();
        assert_eq!(got, first);
        let got: Request = read_frame(&mut server).await.unwrap();
        assert_eq!(got, second);

        let end = read_frame::<_, Request>(&mut server).await.unwrap_err();
        assert!(matches!(end, ProtoError::Closed));
    }

    #[tokio::test]
    async fn test_corrupted_payload_rejected() {
        let mut frame = encode_frame(&Request::Name(NameRequest::ClusterInfo))
            .unwrap()
            .to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut reader = frame.as_slice();
        let err = read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtoError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let header = FrameHeader {
            checksum: 0,
            size: (MAX_FRAME_SIZE + 1) as u32,
        };
        let bytes = header.to_bytes();
        let mut reader = &bytes[..];
        let err = read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtoError::TooLarge { .. }));
    }
}
