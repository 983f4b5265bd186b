//! On-disk format of a chronofile database.
//!
//! A database is a single file of big-endian records. The header and the
//! table of contents sit at fixed offsets; every other record is appended at
//! the end of the file and never moves. Records are linked into chains by
//! absolute file offsets, with `0` as the null pointer (offset 0 is always
//! inside the header, so it can never name a record).
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header                                                      │
//! │  - Magic: "TSDB" (4 bytes)                                   │
//! │  - Version: i32                                              │
//! │  - Metadata: i32 length + bytes                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Table of Contents (32 bytes)                                │
//! │  - first/last ColumnInfo, first/last DataFragment (i64 each) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ColumnInfo and DataFragment records, interleaved in         │
//! │  append order                                                │
//! │  - ColumnInfo chain:   TOC → next → next → 0                 │
//! │  - DataFragment chain: ColumnInfo → next → next → 0          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod column_info;
pub mod fragment;
pub mod header;
pub mod toc;

pub use column_info::ColumnInfo;
pub use fragment::{DataFragment, FragmentHeader, GroupRows, FRAGMENT_HEADER_SIZE};
pub use header::{FileHeader, HEADER_FIXED_SIZE, MAGIC};
pub use toc::{TableOfContents, TOC_SIZE};

use crate::config::SyncMode;
use crate::error::{Result, TsdbError};
use crate::lock::RangeLock;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

/// Size of an on-disk pointer field.
pub const POINTER_SIZE: u64 = 8;

/// On-disk layout version, stored in the header and used to pick the
/// data fragment codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum FormatVersion {
    /// Legacy layout: absolute i64 timestamp and f64 values per row.
    V1 = 1,
    /// Current layout: i32 timestamp relative to the fragment start and
    /// i64 values per row.
    #[default]
    V2 = 2,
}

impl FormatVersion {
    /// Creates a FormatVersion from its on-disk value.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    /// Returns the on-disk value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns the encoded size of one row of `width` values.
    ///
    /// Saturates instead of overflowing; callers sizing on-disk records
    /// check the product with the row count.
    pub fn row_size(self, width: usize) -> u64 {
        let timestamp: u64 = match self {
            Self::V1 => 8,
            Self::V2 => 4,
        };
        (width as u64).saturating_mul(8).saturating_add(timestamp)
    }
}

/// Locking and durability settings threaded through every record operation.
#[derive(Debug, Clone, Copy)]
pub struct IoPolicy {
    /// How long to retry a contended byte-range lock.
    pub lock_timeout: Duration,
    /// How appended records and rewritten pointers are made durable.
    pub sync_mode: SyncMode,
}

impl IoPolicy {
    /// Syncs the file according to the sync mode.
    pub fn sync(&self, file: &File) -> Result<()> {
        self.sync_mode.sync(file)?;
        Ok(())
    }
}

/// Rewrites one pointer field in place under an exclusive 8-byte lock.
pub(crate) fn write_pointer(file: &File, field_offset: u64, value: u64, policy: &IoPolicy) -> Result<()> {
    let _lock = RangeLock::exclusive(file, field_offset, POINTER_SIZE, policy.lock_timeout)?;
    codec::write_all_at(file, field_offset, &(value as i64).to_be_bytes())?;
    Ok(())
}

/// Reads one pointer field under a shared 8-byte lock.
pub(crate) fn read_pointer(file: &File, field_offset: u64, policy: &IoPolicy) -> Result<u64> {
    let _lock = RangeLock::shared(file, field_offset, POINTER_SIZE, policy.lock_timeout)?;
    let mut handle = file;
    handle.seek(SeekFrom::Start(field_offset))?;
    let mut buf = [0u8; 8];
    handle.read_exact(&mut buf)?;
    let raw = i64::from_be_bytes(buf);
    u64::try_from(raw).map_err(|_| TsdbError::corrupt(field_offset, format!("negative offset {}", raw)))
}

/// Checks that `offset` can name a record of at least `min_len` bytes.
pub(crate) fn check_record_offset(offset: u64, data_start: u64, file_len: u64, min_len: u64) -> Result<()> {
    if offset < data_start || offset.saturating_add(min_len) > file_len {
        return Err(TsdbError::corrupt(
            offset,
            format!("record pointer outside data region [{}, {})", data_start, file_len),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version_from_i32() {
        assert_eq!(FormatVersion::from_i32(1), Some(FormatVersion::V1));
        assert_eq!(FormatVersion::from_i32(2), Some(FormatVersion::V2));
        assert_eq!(FormatVersion::from_i32(3), None);
        assert_eq!(FormatVersion::V2.as_i32(), 2);
    }

    #[test]
    fn test_row_size() {
        assert_eq!(FormatVersion::V2.row_size(3), 4 + 24);
        assert_eq!(FormatVersion::V1.row_size(3), 8 + 24);
    }

    #[test]
    fn test_check_record_offset() {
        assert!(check_record_offset(44, 44, 100, 24).is_ok());
        assert!(check_record_offset(43, 44, 100, 24).is_err());
        assert!(check_record_offset(80, 44, 100, 24).is_err());
    }
}
