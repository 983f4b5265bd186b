//! ColumnInfo records: one per measurement group, chained from the TOC.

use super::codec::{self, RecordReader};
use super::{read_pointer, write_pointer, IoPolicy, POINTER_SIZE};
use crate::error::{Result, TsdbError};
use crate::lock::RangeLock;
use std::fs::File;

/// Bytes locked while reading a record whose length is not yet known:
/// the `next` pointer and the group name length.
const READ_PREFIX_LEN: u64 = POINTER_SIZE + 2;

/// Descriptor of one named group of columns.
///
/// Appended once and never relocated. Only the three pointer fields are ever
/// rewritten after the record is written: `next_column_info` when the next
/// group is appended, and the fragment head/tail when rows are flushed.
///
/// ## Binary Layout
///
/// ```text
/// next_column_info     i64
/// group_name           u16 length + modified UTF-8
/// group_meta           i32 length + bytes
/// sample_time_millis   i32
/// column_count         i32
/// column_names         (u16 length + modified UTF-8) * column_count
/// column_meta          (i32 length + bytes) * column_count
/// first_data_fragment  i64
/// last_data_fragment   i64
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    location: u64,
    record_len: u64,
    next_column_info: u64,
    group_name: String,
    group_meta: Vec<u8>,
    sample_time_millis: i32,
    column_names: Vec<String>,
    column_meta: Vec<Vec<u8>>,
    first_data_fragment: u64,
    last_data_fragment: u64,
}

impl ColumnInfo {
    /// Builds a new, not yet written, group descriptor.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::InvalidArgument` if the name is empty, a string is
    /// too long to encode, or `column_meta` is not parallel to `column_names`.
    pub fn new(
        group_name: impl Into<String>,
        group_meta: Vec<u8>,
        sample_time_millis: i32,
        column_names: Vec<String>,
        column_meta: Vec<Vec<u8>>,
    ) -> Result<Self> {
        let group_name = group_name.into();
        if group_name.is_empty() {
            return Err(TsdbError::InvalidArgument("group name must not be empty".to_string()));
        }
        if column_names.len() != column_meta.len() {
            return Err(TsdbError::InvalidArgument(format!(
                "group '{}' has {} column names but {} column metadata entries",
                group_name,
                column_names.len(),
                column_meta.len()
            )));
        }

        let mut info = Self {
            location: 0,
            record_len: 0,
            next_column_info: 0,
            group_name,
            group_meta,
            sample_time_millis,
            column_names,
            column_meta,
            first_data_fragment: 0,
            last_data_fragment: 0,
        };
        // Surfaces encoding limits before anything touches the file.
        info.record_len = info.encode()?.len() as u64;
        Ok(info)
    }

    /// Serialises the record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        codec::put_offset(&mut buf, self.next_column_info);
        codec::put_utf(&mut buf, &self.group_name)?;
        codec::put_blob(&mut buf, &self.group_meta)?;
        codec::put_i32(&mut buf, self.sample_time_millis);
        codec::put_count(&mut buf, self.column_names.len(), "column count")?;
        for name in &self.column_names {
            codec::put_utf(&mut buf, name)?;
        }
        for meta in &self.column_meta {
            codec::put_blob(&mut buf, meta)?;
        }
        codec::put_offset(&mut buf, self.first_data_fragment);
        codec::put_offset(&mut buf, self.last_data_fragment);
        Ok(buf)
    }

    /// Writes the record at `location` under an exclusive lock on its range.
    ///
    /// `location` is the current end of the file; groups are append-only.
    pub fn write_to(&mut self, file: &File, location: u64, policy: &IoPolicy) -> Result<()> {
        let buf = self.encode()?;
        let len = buf.len() as u64;
        let _lock = RangeLock::exclusive(file, location, len, policy.lock_timeout)?;
        codec::write_all_at(file, location, &buf)?;
        self.location = location;
        self.record_len = len;
        Ok(())
    }

    /// Reads the record stored at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::Corrupt` for malformed fields and an I/O error if
    /// the record is truncated.
    pub fn read_from(file: &File, offset: u64, policy: &IoPolicy) -> Result<Self> {
        let _lock = RangeLock::shared(file, offset, READ_PREFIX_LEN, policy.lock_timeout)?;
        let mut reader = RecordReader::at(file, offset)?;

        let next_column_info = reader.read_offset()?;
        let group_name = reader.read_utf()?;
        let group_meta = reader.read_blob()?;
        let sample_time_millis = reader.read_i32()?;
        let count = reader.read_count("column count")?;

        let mut column_names = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            column_names.push(reader.read_utf()?);
        }
        let mut column_meta = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            column_meta.push(reader.read_blob()?);
        }

        let first_data_fragment = reader.read_offset()?;
        let last_data_fragment = reader.read_offset()?;

        Ok(Self {
            location: offset,
            record_len: reader.position() - offset,
            next_column_info,
            group_name,
            group_meta,
            sample_time_millis,
            column_names,
            column_meta,
            first_data_fragment,
            last_data_fragment,
        })
    }

    /// Returns the file offset of this record (0 before it is written).
    pub fn location(&self) -> u64 {
        self.location
    }

    /// Returns the encoded size of this record.
    pub fn record_len(&self) -> u64 {
        self.record_len
    }

    /// Returns the offset of the next ColumnInfo (0 if this is the tail).
    pub fn next_column_info(&self) -> u64 {
        self.next_column_info
    }

    /// Returns the unique group name.
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Returns the group's free-form metadata.
    pub fn group_meta(&self) -> &[u8] {
        &self.group_meta
    }

    /// Returns the nominal sampling interval.
    pub fn sample_time_millis(&self) -> i32 {
        self.sample_time_millis
    }

    /// Returns the column names in row order.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Returns the per-column metadata, parallel to [`column_names`](Self::column_names).
    pub fn column_meta(&self) -> &[Vec<u8>] {
        &self.column_meta
    }

    /// Returns the number of columns, which is also the width of every row.
    pub fn column_count(&self) -> usize {
        self.column_names.len()
    }

    /// Returns the head of this group's fragment chain (0 if empty).
    pub fn first_data_fragment(&self) -> u64 {
        self.first_data_fragment
    }

    /// Returns the tail of this group's fragment chain (0 if empty).
    pub fn last_data_fragment(&self) -> u64 {
        self.last_data_fragment
    }

    fn first_fragment_field(&self) -> u64 {
        self.location + self.record_len - 2 * POINTER_SIZE
    }

    fn last_fragment_field(&self) -> u64 {
        self.location + self.record_len - POINTER_SIZE
    }

    /// Links the next group after this one.
    pub fn set_next_column_info(&mut self, file: &File, offset: u64, policy: &IoPolicy) -> Result<()> {
        write_pointer(file, self.location, offset, policy)?;
        self.next_column_info = offset;
        Ok(())
    }

    /// Sets the head of this group's fragment chain.
    pub fn set_first_data_fragment(&mut self, file: &File, offset: u64, policy: &IoPolicy) -> Result<()> {
        write_pointer(file, self.first_fragment_field(), offset, policy)?;
        self.first_data_fragment = offset;
        Ok(())
    }

    /// Sets the tail of this group's fragment chain.
    pub fn set_last_data_fragment(&mut self, file: &File, offset: u64, policy: &IoPolicy) -> Result<()> {
        write_pointer(file, self.last_fragment_field(), offset, policy)?;
        self.last_data_fragment = offset;
        Ok(())
    }

    /// Re-reads the mutable pointer fields from disk.
    ///
    /// Used by read-only handles to observe groups, fragments and successors
    /// appended by a writer after this record was loaded.
    pub fn reload_pointers(&mut self, file: &File, policy: &IoPolicy) -> Result<()> {
        self.next_column_info = read_pointer(file, self.location, policy)?;
        self.first_data_fragment = read_pointer(file, self.first_fragment_field(), policy)?;
        self.last_data_fragment = read_pointer(file, self.last_fragment_field(), policy)?;
        Ok(())
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

    fn latency() -> ColumnInfo {
        ColumnInfo::new(
            "latency",
            b"request latency".to_vec(),
            1000,
            vec!["min".to_string(), "max".to_string(), "count".to_string()],
            vec![b"ms".to_vec(), b"ms".to_vec(), Vec::new()],
        )
        .unwrap()
    }

    #[test]
    fn test_new_validates_parallel_arrays() {
        let result = ColumnInfo::new("g", Vec::new(), 10, vec!["a".to_string()], Vec::new());
        assert!(matches!(result, Err(TsdbError::InvalidArgument(_))));

        let result = ColumnInfo::new("", Vec::new(), 10, Vec::new(), Vec::new());
        assert!(matches!(result, Err(TsdbError::InvalidArgument(_))));
    }

    #[test]
    fn test_encoded_layout() {
        let info = latency();
        let buf = info.encode().unwrap();
        assert_eq!(buf.len() as u64, info.record_len());
        // next pointer, then "latency" with a 2-byte length.
        assert_eq!(&buf[0..8], &[0u8; 8]);
        assert_eq!(&buf[8..10], &[0, 7]);
        assert_eq!(&buf[10..17], b"latency");
        // Trailing fragment pointers.
        assert_eq!(&buf[buf.len() - 16..], &[0u8; 16]);
    }

    #[test]
    fn test_write_read_and_pointer_updates() {
        let dir = TempDir::new().unwrap();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join("ci.tsdb"))
            .unwrap();
        codec::write_all_at(&file, 0, &[0u8; 44]).unwrap();

        let mut info = latency();
        info.write_to(&file, 44, &policy()).unwrap();
        assert_eq!(info.location(), 44);

        info.set_first_data_fragment(&file, 500, &policy()).unwrap();
        info.set_last_data_fragment(&file, 900, &policy()).unwrap();
        info.set_next_column_info(&file, 300, &policy()).unwrap();

        let read = ColumnInfo::read_from(&file, 44, &policy()).unwrap();
        assert_eq!(read, info);
        assert_eq!(read.column_count(), 3);
        assert_eq!(read.column_meta()[0], b"ms".to_vec());
        assert_eq!(read.first_data_fragment(), 500);
        assert_eq!(read.last_data_fragment(), 900);
        assert_eq!(read.next_column_info(), 300);

        let mut reloaded = ColumnInfo::read_from(&file, 44, &policy()).unwrap();
        write_pointer(&file, info.location() + info.record_len() - 8, 1234, &policy()).unwrap();
        reloaded.reload_pointers(&file, &policy()).unwrap();
        assert_eq!(reloaded.last_data_fragment(), 1234);
    }
}
