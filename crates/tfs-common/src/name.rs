//! Canonical TFS file names
//!
//! A canonical name is 18 ASCII characters: a kind prefix (`T` for small
//! files, `L` for large-file indexes), one cluster-id digit, and 16 characters
//! that encode `[block_id u32][seq_id u32][suffix_hash u32]` (little endian,
//! XOR-masked, 6 bits per character). A user-facing name may carry the file's
//! suffix after those 18 characters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checksum::suffix_hash;
use crate::error::{Error, Result};
use crate::types::{BlockId, FileId, FILE_NAME_LEN, MAX_FILE_NAME_LEN, MAX_SUFFIX_LEN};

const ALPHABET: &[u8; 64] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz._";
const MASK: [u8; 12] = [
    0x4a, 0x1f, 0x93, 0x6e, 0xc2, 0x35, 0xb7, 0x08, 0xd4, 0x71, 0x2c, 0xe9,
];
const PAYLOAD_LEN: usize = 12;
const ENCODED_LEN: usize = 16;

/// Kind of file a name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameKind {
    Small,
    Large,
}

impl NameKind {
    #[must_use]
    pub const fn prefix(self) -> char {
        match self {
            Self::Small => 'T',
            Self::Large => 'L',
        }
    }

    fn from_prefix(c: u8) -> Option<Self> {
        match c {
            b'T' => Some(Self::Small),
            b'L' => Some(Self::Large),
            _ => None,
        }
    }
}

/// Decoded canonical file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FsName {
    pub kind: NameKind,
    /// Cluster id digit, 0..=9
    pub cluster_id: u8,
    pub block_id: BlockId,
    pub seq_id: u32,
    pub suffix_hash: u32,
}

impl FsName {
    #[must_use]
    pub const fn new(kind: NameKind, cluster_id: u8, block_id: BlockId, file_id: FileId) -> Self {
        Self {
            kind,
            cluster_id: cluster_id % 10,
            block_id,
            seq_id: file_id.seq_id(),
            suffix_hash: file_id.suffix_hash(),
        }
    }

    #[must_use]
    pub const fn file_id(&self) -> FileId {
        FileId::new(self.seq_id, self.suffix_hash)
    }

    /// Encode to the 18-character canonical form
    #[must_use]
    pub fn encode(&self) -> String {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0..4].copy_from_slice(&self.block_id.0.to_le_bytes());
        payload[4..8].copy_from_slice(&self.seq_id.to_le_bytes());
        payload[8..12].copy_from_slice(&self.suffix_hash.to_le_bytes());
        for (byte, mask) in payload.iter_mut().zip(MASK) {
            *byte ^= mask;
        }

        let mut out = String::with_capacity(FILE_NAME_LEN);
        out.push(self.kind.prefix());
        out.push(char::from(b'0' + self.cluster_id));
        for chunk in payload.chunks(3) {
            let v = (u32::from(chunk[0]) << 16) | (u32::from(chunk[1]) << 8) | u32::from(chunk[2]);
            for shift in [18, 12, 6, 0] {
                out.push(char::from(ALPHABET[((v >> shift) & 0x3f) as usize]));
            }
        }
        out
    }

    /// Parse a user-supplied name.
    ///
    /// Returns the decoded name and the effective suffix: the one appended to
    /// the name if present, otherwise `suffix`. When both are given they must
    /// agree. The embedded suffix hash is checked only when a suffix is known.
    pub fn parse(name: &str, suffix: &str) -> Result<(Self, String)> {
        let invalid = |why: &str| Err(Error::InvalidFileName(format!("{name:?}: {why}")));

        if name.len() < FILE_NAME_LEN {
            return invalid("too short");
        }
        if name.len() > MAX_FILE_NAME_LEN {
            return invalid("too long");
        }
        let (Some(head), Some(appended)) = (name.get(..FILE_NAME_LEN), name.get(FILE_NAME_LEN..))
        else {
            return invalid("not ascii");
        };
        let bytes = head.as_bytes();

        let Some(kind) = NameKind::from_prefix(bytes[0]) else {
            return invalid("unknown prefix");
        };
        if !bytes[1].is_ascii_digit() {
            return invalid("bad cluster id");
        }
        let cluster_id = bytes[1] - b'0';

        let mut payload = [0u8; PAYLOAD_LEN];
        for (i, quad) in bytes[2..2 + ENCODED_LEN].chunks(4).enumerate() {
            let mut v = 0u32;
            for &c in quad {
                let Some(digit) = decode_char(c) else {
                    return invalid("bad character");
                };
                v = (v << 6) | u32::from(digit);
            }
            payload[i * 3] = (v >> 16) as u8;
            payload[i * 3 + 1] = (v >> 8) as u8;
            payload[i * 3 + 2] = v as u8;
        }
        for (byte, mask) in payload.iter_mut().zip(MASK) {
            *byte ^= mask;
        }
        let word = |at: usize| {
            u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        };

        let parsed = Self {
            kind,
            cluster_id,
            block_id: BlockId(word(0)),
            seq_id: word(4),
            suffix_hash: word(8),
        };

        if !appended.is_empty() && !suffix.is_empty() && appended != suffix {
            return invalid("suffix does not match the name");
        }
        let effective = if appended.is_empty() { suffix } else { appended };
        if effective.len() > MAX_SUFFIX_LEN {
            return invalid("suffix too long");
        }
        if !effective.is_empty() && suffix_hash(effective) != parsed.suffix_hash {
            return invalid("suffix does not belong to this file");
        }

        Ok((parsed, effective.to_string()))
    }
}

impl fmt::Display for FsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn decode_char(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'Z' => Some(c - b'A' + 10),
        b'a'..=b'z' => Some(c - b'a' + 36),
        b'.' => Some(62),
        b'_' => Some(63),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(suffix: &str) -> FsName {
        FsName::new(
            NameKind::Small,
            3,
            BlockId(0x0102_0304),
            FileId::new(42, suffix_hash(suffix)),
        )
    }

    #[test]
    fn test_encode_shape() {
        let encoded = sample(".jpg").encode();
        assert_eq!(encoded.len(), FILE_NAME_LEN);
        assert!(encoded.starts_with("T3"));
        assert!(encoded.bytes().all(|c| ALPHABET.contains(&c)));
    }

    #[test]
    fn test_parse_round_trip() {
        let name = sample(".jpg");
        let (parsed, suffix) = FsName::parse(&name.encode(), ".jpg").unwrap();
        assert_eq!(parsed, name);
        assert_eq!(suffix, ".jpg");

        // Suffix appended to the name
        let full = format!("{}.jpg", name.encode());
        let (parsed, suffix) = FsName::parse(&full, "").unwrap();
        assert_eq!(parsed, name);
        assert_eq!(suffix, ".jpg");
    }

    #[test]
    fn test_parse_large_kind() {
        let name = FsName::new(NameKind::Large, 1, BlockId(9), FileId::new(1, 0));
        let (parsed, _) = FsName::parse(&name.encode(), "").unwrap();
        assert_eq!(parsed.kind, NameKind::Large);
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        let good = sample(".jpg").encode();

        assert!(FsName::parse("T1short", "").is_err());
        assert!(FsName::parse(&format!("X{}", &good[1..]), "").is_err());
        assert!(FsName::parse(&format!("Tx{}", &good[2..]), "").is_err());
        assert!(FsName::parse(&format!("{}!", &good[..17]), "").is_err());
        assert!(FsName::parse(&"T1".repeat(70), "").is_err());
    }

    #[test]
    fn test_parse_suffix_conflicts() {
        let name = sample(".jpg").encode();

        let conflicting = format!("{name}.jpg");
        assert!(FsName::parse(&conflicting, ".png").is_err());
        // Wrong suffix for the embedded hash
        assert!(FsName::parse(&name, ".png").is_err());
        // No suffix known: hash is not checked
        assert!(FsName::parse(&name, "").is_ok());
    }
}
