//! Table of contents: the recovery root of the file.

use super::codec::{self, RecordReader};
use super::{write_pointer, IoPolicy, POINTER_SIZE};
use crate::error::Result;
use crate::lock::RangeLock;
use std::fs::File;
use std::io::Write;

/// Size of the table of contents in bytes.
pub const TOC_SIZE: u64 = 32;

const FIRST_COLUMN_INFO: u64 = 0;
const LAST_COLUMN_INFO: u64 = 8;
const FIRST_DATA_FRAGMENT: u64 = 16;
const LAST_DATA_FRAGMENT: u64 = 24;

/// Fixed-size root index stored directly after the header.
///
/// Holds the head and tail of the ColumnInfo chain, plus the first data
/// fragment ever appended and the most recent one across all groups. Reads
/// follow the per-group pointers in each [`ColumnInfo`](super::ColumnInfo);
/// the global fragment pointers are kept up to date but never walked.
///
/// Every setter rewrites a single 8-byte field under an exclusive lock on
/// just that field and syncs before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableOfContents {
    location: u64,
    first_column_info: u64,
    last_column_info: u64,
    first_data_fragment: u64,
    last_data_fragment: u64,
}

impl TableOfContents {
    /// Creates an empty table of contents located at `location`.
    pub fn create(location: u64) -> Self {
        Self {
            location,
            first_column_info: 0,
            last_column_info: 0,
            first_data_fragment: 0,
            last_data_fragment: 0,
        }
    }

    /// Writes the four pointer fields.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(TOC_SIZE as usize);
        codec::put_offset(&mut buf, self.first_column_info);
        codec::put_offset(&mut buf, self.last_column_info);
        codec::put_offset(&mut buf, self.first_data_fragment);
        codec::put_offset(&mut buf, self.last_data_fragment);
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Loads the table of contents under a shared lock over its 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is truncated or a pointer is negative.
    pub fn load(file: &File, location: u64, policy: &IoPolicy) -> Result<Self> {
        let _lock = RangeLock::shared(file, location, TOC_SIZE, policy.lock_timeout)?;
        let mut reader = RecordReader::at(file, location)?;
        Ok(Self {
            location,
            first_column_info: reader.read_offset()?,
            last_column_info: reader.read_offset()?,
            first_data_fragment: reader.read_offset()?,
            last_data_fragment: reader.read_offset()?,
        })
    }

    /// Returns the file offset of the table of contents.
    pub fn location(&self) -> u64 {
        self.location
    }

    /// Returns the offset of the first byte after the table of contents,
    /// where appended records begin.
    pub fn data_start(&self) -> u64 {
        self.location + TOC_SIZE
    }

    /// Returns the head of the ColumnInfo chain (0 if empty).
    pub fn first_column_info(&self) -> u64 {
        self.first_column_info
    }

    /// Returns the tail of the ColumnInfo chain (0 if empty).
    pub fn last_column_info(&self) -> u64 {
        self.last_column_info
    }

    /// Returns the first data fragment ever appended (0 if none).
    pub fn first_data_fragment(&self) -> u64 {
        self.first_data_fragment
    }

    /// Returns the most recently appended data fragment (0 if none).
    pub fn last_data_fragment(&self) -> u64 {
        self.last_data_fragment
    }

    /// Sets the head of the ColumnInfo chain.
    pub fn set_first_column_info(&mut self, file: &File, offset: u64, policy: &IoPolicy) -> Result<()> {
        self.set_field(file, FIRST_COLUMN_INFO, offset, policy)?;
        self.first_column_info = offset;
        Ok(())
    }

    /// Sets the tail of the ColumnInfo chain.
    pub fn set_last_column_info(&mut self, file: &File, offset: u64, policy: &IoPolicy) -> Result<()> {
        self.set_field(file, LAST_COLUMN_INFO, offset, policy)?;
        self.last_column_info = offset;
        Ok(())
    }

    /// Sets the global first data fragment.
    pub fn set_first_data_fragment(&mut self, file: &File, offset: u64, policy: &IoPolicy) -> Result<()> {
        self.set_field(file, FIRST_DATA_FRAGMENT, offset, policy)?;
        self.first_data_fragment = offset;
        Ok(())
    }

    /// Sets the global last data fragment.
    pub fn set_last_data_fragment(&mut self, file: &File, offset: u64, policy: &IoPolicy) -> Result<()> {
        self.set_field(file, LAST_DATA_FRAGMENT, offset, policy)?;
        self.last_data_fragment = offset;
        Ok(())
    }

    fn set_field(&self, file: &File, field: u64, value: u64, policy: &IoPolicy) -> Result<()> {
        debug_assert!(field + POINTER_SIZE <= TOC_SIZE);
        write_pointer(file, self.location + field, value, policy)?;
        policy.sync(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use std::fs::OpenOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy() -> IoPolicy {
        IoPolicy {
            lock_timeout: Duration::from_millis(100),
            sync_mode: SyncMode::None,
        }
    }

    #[test]
    fn test_toc_size() {
        let toc = TableOfContents::create(20);
        let mut buf = Vec::new();
        toc.write_to(&mut buf).unwrap();
        assert_eq!(buf, vec![0u8; TOC_SIZE as usize]);
        assert_eq!(toc.data_start(), 52);
    }

    #[test]
    fn test_setters_rewrite_single_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("toc.tsdb");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        // Pad with a fake 16-byte header so the TOC is not at offset 0.
        let mut toc = TableOfContents::create(16);
        let mut buf = vec![0xAA; 16];
        toc.write_to(&mut buf).unwrap();
        codec::write_all_at(&file, 0, &buf).unwrap();

        toc.set_first_column_info(&file, 48, &policy()).unwrap();
        toc.set_last_column_info(&file, 96, &policy()).unwrap();
        toc.set_last_data_fragment(&file, 200, &policy()).unwrap();

        let loaded = TableOfContents::load(&file, 16, &policy()).unwrap();
        assert_eq!(loaded, toc);
        assert_eq!(loaded.first_column_info(), 48);
        assert_eq!(loaded.last_column_info(), 96);
        assert_eq!(loaded.first_data_fragment(), 0);
        assert_eq!(loaded.last_data_fragment(), 200);

        // Header bytes untouched.
        let raw = std::fs::read(&path).unwrap();
        assert!(raw[..16].iter().all(|&b| b == 0xAA));
    }
}
