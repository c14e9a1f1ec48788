//! Core type definitions for TFS
//!
//! Identifiers, flag sets and the stat snapshot shared by the client, the
//! wire protocol and the reference cluster.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{Error, Result};

/// Length of a canonical file name
pub const FILE_NAME_LEN: usize = 18;
/// Length of a canonical file name including the terminator of the C API
pub const TFS_FILE_LEN: usize = 19;
/// Characters of the canonical name that carry prefix, cluster and block data
pub const FILE_NAME_EXCEPT_SUFFIX_LEN: usize = 12;
/// Maximum accepted length of a user supplied name
pub const MAX_FILE_NAME_LEN: usize = 128;
/// Maximum suffix length
pub const MAX_SUFFIX_LEN: usize = MAX_FILE_NAME_LEN - TFS_FILE_LEN;
/// Length of a typical extension such as ".jpg"
pub const STANDARD_SUFFIX_LEN: usize = 4;

/// Default resolver cache time in seconds
pub const DEFAULT_BLOCK_CACHE_TIME: i64 = 1800;
/// Default resolver cache capacity
pub const DEFAULT_BLOCK_CACHE_ITEMS: i64 = 500_000;

/// Identifier of a block on the cluster
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct BlockId(pub u32);

/// Identifier of a file inside a block
///
/// The high 32 bits hold the suffix hash, the low 32 bits the sequence id.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct FileId(pub u64);

impl FileId {
    #[must_use]
    pub const fn new(seq_id: u32, suffix_hash: u32) -> Self {
        Self(((suffix_hash as u64) << 32) | seq_id as u64)
    }

    #[must_use]
    pub const fn seq_id(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    #[must_use]
    pub const fn suffix_hash(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Open mode bitmask
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const DEFAULT: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const CREATE: Self = Self(4);
    pub const NEWBLK: Self = Self(8);
    pub const NOLEASE: Self = Self(16);
    pub const STAT: Self = Self(32);
    pub const LARGE: Self = Self(64);
    pub const UNLINK: Self = Self(128);
    pub const FORCE: Self = Self(256);

    const NAMES: [(Self, &'static str); 9] = [
        (Self::READ, "READ"),
        (Self::WRITE, "WRITE"),
        (Self::CREATE, "CREATE"),
        (Self::NEWBLK, "NEWBLK"),
        (Self::NOLEASE, "NOLEASE"),
        (Self::STAT, "STAT"),
        (Self::LARGE, "LARGE"),
        (Self::UNLINK, "UNLINK"),
        (Self::FORCE, "FORCE"),
    ];

    const ALL: u32 = 0x1FF;

    /// Build from a raw bitmask, rejecting unknown bits
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(Error::InvalidFlags(format!("unknown bits {bits:#x}")));
        }
        Ok(Self(bits))
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    #[must_use]
    pub const fn is_read(self) -> bool {
        self.contains(Self::READ)
    }

    #[must_use]
    pub const fn is_large(self) -> bool {
        self.contains(Self::LARGE)
    }

    /// Check the combination rules for `open`.
    ///
    /// `has_name` is whether a file name was supplied.
    pub fn validate(self, has_name: bool) -> Result<()> {
        let fail = |msg: &str| Err(Error::InvalidFlags(format!("{self:?}: {msg}")));

        if self.contains(Self::UNLINK) {
            return fail("UNLINK is not an open mode");
        }
        let rw = self.intersects(Self::READ | Self::WRITE);
        let stat = self.contains(Self::STAT);
        if rw == stat {
            return fail("exactly one of READ/WRITE or STAT is required");
        }
        if self.contains(Self::CREATE) {
            if !self.is_write() {
                return fail("CREATE requires WRITE");
            }
            if has_name {
                return fail("CREATE requires an empty file name");
            }
        } else if self.is_write() && !has_name {
            return fail("WRITE without CREATE requires a file name");
        }
        if self.contains(Self::NEWBLK) && !self.contains(Self::CREATE) {
            return fail("NEWBLK requires CREATE");
        }
        if self.contains(Self::NOLEASE) && !self.is_write() {
            return fail("NOLEASE requires WRITE");
        }
        if self.is_large() && self.is_write() && !self.contains(Self::CREATE) {
            return fail("large files cannot be updated in place");
        }
        if (stat || (self.is_read() && !self.contains(Self::CREATE))) && !has_name {
            return fail("READ and STAT require a file name");
        }
        Ok(())
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("DEFAULT");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Origin for `seek`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekWhence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl TryFrom<i32> for SeekWhence {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            other => Err(Error::invalid_argument(format!("seek whence {other}"))),
        }
    }
}

/// Stat mode: NORMAL hides deleted and concealed files, FORCE does not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatMode {
    #[default]
    Normal = 0,
    Force = 1,
}

impl TryFrom<i32> for StatMode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Force),
            other => Err(Error::invalid_argument(format!("stat mode {other}"))),
        }
    }
}

/// State transition requested by `unlink`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnlinkAction {
    Delete = 0,
    Undelete = 2,
    Conceal = 4,
    Reveal = 6,
}

/// An unlink action plus the OVERRIDE modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnlinkType {
    pub action: UnlinkAction,
    /// Apply the action regardless of the current file state
    pub override_state: bool,
}

impl UnlinkType {
    pub const OVERRIDE: i32 = 128;

    #[must_use]
    pub const fn new(action: UnlinkAction) -> Self {
        Self {
            action,
            override_state: false,
        }
    }

    #[must_use]
    pub const fn with_override(mut self) -> Self {
        self.override_state = true;
        self
    }

    /// Decode the raw integer form, with OVERRIDE as an orthogonal bit
    pub fn from_raw(raw: i32) -> Result<Self> {
        let override_state = raw & Self::OVERRIDE != 0;
        let action = match raw & !Self::OVERRIDE {
            0 => UnlinkAction::Delete,
            2 => UnlinkAction::Undelete,
            4 => UnlinkAction::Conceal,
            6 => UnlinkAction::Reveal,
            other => {
                return Err(Error::invalid_argument(format!("unlink action {other}")));
            }
        };
        Ok(Self {
            action,
            override_state,
        })
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        let base = self.action as i32;
        if self.override_state {
            base | Self::OVERRIDE
        } else {
            base
        }
    }
}

impl From<UnlinkAction> for UnlinkType {
    fn from(action: UnlinkAction) -> Self {
        Self::new(action)
    }
}

/// Per-descriptor option flag that changes close behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptionFlag {
    #[default]
    Default = 0,
    /// Ask the data server not to write a sync-log record for the commit
    NoSyncLog = 1,
    /// The caller's write failed; abort instead of committing
    CloseFlagWriteDataFailed = 2,
}

impl TryFrom<i32> for OptionFlag {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Default),
            1 => Ok(Self::NoSyncLog),
            2 => Ok(Self::CloseFlagWriteDataFailed),
            other => Err(Error::invalid_argument(format!("option flag {other}"))),
        }
    }
}

/// Server-side file state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
pub enum FileStatus {
    #[default]
    Normal,
    Deleted,
    Concealed,
    Writing,
}

impl FileStatus {
    /// Bit pattern reported in `TfsFileStat::flag`
    #[must_use]
    pub const fn flag_bits(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::Deleted => 1,
            Self::Concealed => 4,
            Self::Writing => 8,
        }
    }

    #[must_use]
    pub const fn is_visible(self) -> bool {
        matches!(self, Self::Normal)
    }
}

/// Snapshot of a file's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TfsFileStat {
    pub file_id: u64,
    /// Offset of the file inside its block
    pub offset: i32,
    pub size: i64,
    /// Size on disk including the per-file header
    pub usize: i64,
    pub modify_time: i64,
    pub create_time: i64,
    pub flag: i32,
    pub crc: u32,
}
