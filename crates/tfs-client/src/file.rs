//! Open-file state
//!
//! What a descriptor owns between open and close. The network side lives in
//! `dispatch` and `large`; everything here is plain bookkeeping.

use tfs_common::{ChecksumCalculator, Error, OpenFlags, OptionFlag, Result, SeekWhence};
use tfs_proto::FileInfo;

use crate::io::LeaseHandle;
use crate::large::{LargeReader, LargeWriter};
use crate::resolver::Location;

/// What sits in a descriptor table slot
pub type Descriptor = tokio::sync::Mutex<OpenFile>;

pub struct OpenFile {
    pub flags: OpenFlags,
    pub option: OptionFlag,
    /// Sequential read/write position
    pub offset: u64,
    /// Name handed back by close
    pub name: String,
    pub body: Body,
}

pub enum Body {
    Small(SmallFile),
    LargeRead(LargeReader),
    LargeWrite(LargeWriter),
}

impl OpenFile {
    pub const fn new(flags: OpenFlags, name: String, body: Body) -> Self {
        Self {
            flags,
            option: OptionFlag::Default,
            offset: 0,
            name,
            body,
        }
    }

    pub fn require_read(&self) -> Result<()> {
        if self.flags.is_read() {
            Ok(())
        } else {
            Err(Error::NotPermitted(format!(
                "{} is not open for reading ({:?})",
                self.name, self.flags
            )))
        }
    }

    pub fn require_write(&self) -> Result<()> {
        if self.flags.is_write() {
            Ok(())
        } else {
            Err(Error::NotPermitted(format!(
                "{} is not open for writing ({:?})",
                self.name, self.flags
            )))
        }
    }

    /// Size used for seek bounds and `get_file_length`
    pub fn len(&self) -> u64 {
        match &self.body {
            Body::Small(small) => small.len(self.flags),
            Body::LargeRead(reader) => reader.len(),
            Body::LargeWrite(writer) => writer.len(),
        }
    }
}

/// A small file, or the raw contents of a large file's index
pub struct SmallFile {
    pub location: Location,
    pub lease: Option<LeaseHandle>,
    /// Allocated by this open
    pub created: bool,
    pub pending: WriteBuffer,
    /// Size the file is committed with: its size at open, extended by
    /// writes past the end
    pub high_water: u64,
    /// Written through this descriptor since open
    pub dirty: bool,
    pub crc: SequentialCrc,
    /// Last metadata seen from the data server
    pub info: Option<FileInfo>,
}

impl SmallFile {
    pub fn new(location: Location, lease: Option<LeaseHandle>, created: bool) -> Self {
        Self {
            location,
            lease,
            created,
            pending: WriteBuffer::default(),
            high_water: 0,
            dirty: false,
            crc: SequentialCrc::default(),
            info: None,
        }
    }

    pub fn lease_id(&self) -> Option<u64> {
        self.lease.map(|l| l.lease_id)
    }

    fn len(&self, flags: OpenFlags) -> u64 {
        if flags.is_write() {
            self.high_water
        } else {
            self.info.map_or(0, |i| i.size)
        }
    }

    /// Record `data` as written at `offset`
    pub fn stage(&mut self, offset: u64, data: &[u8]) {
        self.crc.observe(offset, data);
        self.pending.push(offset, data);
        self.high_water = self.high_water.max(offset + data.len() as u64);
        self.dirty = true;
    }
}

/// Pending writes: one contiguous run of bytes
#[derive(Debug, Default)]
pub struct WriteBuffer {
    offset: u64,
    data: Vec<u8>,
}

impl WriteBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether a write at `offset` extends the buffered run
    pub fn continues(&self, offset: u64) -> bool {
        self.data.is_empty() || self.offset + self.data.len() as u64 == offset
    }

    pub fn push(&mut self, offset: u64, data: &[u8]) {
        if self.data.is_empty() {
            self.offset = offset;
        }
        self.data.extend_from_slice(data);
    }

    pub fn take(&mut self) -> Option<(u64, Vec<u8>)> {
        if self.data.is_empty() {
            return None;
        }
        Some((self.offset, std::mem::take(&mut self.data)))
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// CRC of a file written front to back. Any write that does not continue
/// where the previous one ended makes the final CRC unknown.
#[derive(Debug, Clone, Copy)]
pub struct SequentialCrc(Option<ChecksumCalculator>);

impl Default for SequentialCrc {
    fn default() -> Self {
        Self(Some(ChecksumCalculator::new()))
    }
}

impl SequentialCrc {
    pub fn observe(&mut self, offset: u64, data: &[u8]) {
        if let Some(calc) = &mut self.0
            && calc.len() == offset
        {
            calc.update(data);
        } else {
            self.0 = None;
        }
    }

    /// CRC of a file of `size` bytes, if every byte went through `observe`
    pub fn value_for(&self, size: u64) -> Option<u32> {
        self.0
            .filter(|calc| calc.len() == size)
            .map(|calc| calc.value())
    }
}

/// New absolute position for a seek.
///
/// Only write-mode descriptors may move past `size`.
pub fn seek_target(
    current: u64,
    size: u64,
    offset: i64,
    whence: SeekWhence,
    may_extend: bool,
) -> Result<u64> {
    let base = match whence {
        SeekWhence::Set => 0,
        SeekWhence::Cur => current,
        SeekWhence::End => size,
    };
    let base = i64::try_from(base).map_err(|_| Error::invalid_argument("offset overflow"))?;
    let target = base
        .checked_add(offset)
        .ok_or_else(|| Error::invalid_argument("offset overflow"))?;
    let target = u64::try_from(target)
        .map_err(|_| Error::invalid_argument(format!("seek to negative offset {target}")))?;
    if target > size && !may_extend {
        return Err(Error::invalid_argument(format!(
            "seek to {target} past end of file ({size} bytes)"
        )));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfs_common::checksum::compute_crc32c;

    #[test]
    fn test_write_buffer_runs() {
        let mut buf = WriteBuffer::default();
        assert!(buf.continues(100));
        buf.push(100, b"abc");
        assert!(buf.continues(103));
        assert!(!buf.continues(0));
        buf.push(103, b"de");
        assert_eq!(buf.take(), Some((100, b"abcde".to_vec())));
        assert!(buf.take().is_none());
    }

    #[test]
    fn test_sequential_crc() {
        let mut crc = SequentialCrc::default();
        crc.observe(0, b"hello ");
        crc.observe(6, b"world");
        assert_eq!(crc.value_for(11), Some(compute_crc32c(b"hello world")));
        assert_eq!(crc.value_for(12), None);

        crc.observe(2, b"x");
        assert_eq!(crc.value_for(11), None);
    }

    #[test]
    fn test_seek_target() {
        assert_eq!(seek_target(5, 10, 2, SeekWhence::Set, false).unwrap(), 2);
        assert_eq!(seek_target(5, 10, 2, SeekWhence::Cur, false).unwrap(), 7);
        assert_eq!(seek_target(5, 10, -3, SeekWhence::End, false).unwrap(), 7);
        assert_eq!(seek_target(5, 10, 0, SeekWhence::End, false).unwrap(), 10);

        assert!(seek_target(5, 10, 1, SeekWhence::End, false).is_err());
        assert_eq!(seek_target(5, 10, 1, SeekWhence::End, true).unwrap(), 11);
        assert!(seek_target(5, 10, -6, SeekWhence::Cur, true).is_err());
    }
}
