//! Checksum utilities for TFS
//!
//! File contents, wire frames and file-name suffixes are all protected with
//! CRC32C.

/// Streaming CRC32C calculator
///
/// Fed with every byte written to a file so the final checksum can be sent
/// along with the commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumCalculator {
    crc32c: u32,
    len: u64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub const fn new() -> Self {
        Self { crc32c: 0, len: 0 }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.len += data.len() as u64;
    }

    /// Current checksum value
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.crc32c
    }

    /// Number of bytes fed so far
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reset the calculator for reuse
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Hash of a file-name suffix as embedded in the canonical name.
///
/// An empty suffix hashes to zero.
#[must_use]
pub fn suffix_hash(suffix: &str) -> u32 {
    if suffix.is_empty() {
        0
    } else {
        crc32c::crc32c(suffix.as_bytes())
    }
}
