//! Data fragments: batches of rows chained per group.
//!
//! A fragment is built in memory by [`DataFragment::push`], appended once at
//! the end of the file, and afterwards only its `next` pointer is rewritten.
//! Readers walk the chain through [`FragmentHeader`], which decodes just the
//! fixed 24-byte prefix so whole fragments can be skipped by time range.

use super::codec::{self, RecordReader};
use super::{check_record_offset, write_pointer, FormatVersion, IoPolicy};
use crate::error::{Result, TsdbError};
use crate::lock::RangeLock;
use std::fs::File;

/// Size of the fixed fragment prefix: next, start, row count, row width.
pub const FRAGMENT_HEADER_SIZE: u64 = 24;

/// Rows returned by a range read.
///
/// `timestamps[i]` is the absolute timestamp of `rows[i]`; every row has one
/// value per column of its group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRows {
    /// Absolute timestamps in milliseconds, non-decreasing.
    pub timestamps: Vec<i64>,
    /// Row values, parallel to `timestamps`.
    pub rows: Vec<Vec<i64>>,
}

impl GroupRows {
    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if no rows matched.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Iterates over `(timestamp, values)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &[i64])> {
        self.timestamps
            .iter()
            .copied()
            .zip(self.rows.iter().map(Vec::as_slice))
    }

    fn push(&mut self, timestamp: i64, row: Vec<i64>) {
        self.timestamps.push(timestamp);
        self.rows.push(row);
    }
}

/// Whether a scan may continue into the next fragment of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scan {
    /// Every row of the fragment was at or before the upper bound.
    Continue,
    /// A row past the upper bound was seen; later fragments cannot match.
    PastEnd,
}

/// A batch of rows for one group.
///
/// ## Binary Layout
///
/// ```text
/// next_data_fragment  i64
/// start_time_millis   i64
/// row_count           i32
/// row_width           i32
/// rows                row_count * row
///
/// v2 row: relative timestamp (i32) + row_width * i64
/// v1 row: absolute timestamp (i64) + row_width * f64
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragment {
    start_time_millis: i64,
    row_width: usize,
    timestamps: Vec<i64>,
    values: Vec<i64>,
}

impl DataFragment {
    /// Creates an empty fragment whose relative timestamps are measured from
    /// `start_time_millis`.
    pub fn new(start_time_millis: i64, row_width: usize) -> Self {
        Self {
            start_time_millis,
            row_width,
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Returns true if a row at `timestamp` can be encoded in this fragment.
    ///
    /// Version 2 stores timestamps as i32 offsets from the start, so a row
    /// more than `i32::MAX` milliseconds away needs a new fragment.
    pub fn fits(&self, timestamp: i64, version: FormatVersion) -> bool {
        match version {
            FormatVersion::V1 => true,
            FormatVersion::V2 => timestamp
                .checked_sub(self.start_time_millis)
                .is_some_and(|delta| (0..=i32::MAX as i64).contains(&delta)),
        }
    }

    /// Appends a row. The caller checks width, ordering and [`fits`](Self::fits).
    pub fn push(&mut self, timestamp: i64, values: &[i64]) {
        debug_assert_eq!(values.len(), self.row_width);
        self.timestamps.push(timestamp);
        self.values.extend_from_slice(values);
    }

    /// Returns the number of rows.
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    fn row(&self, index: usize) -> &[i64] {
        let start = index * self.row_width;
        &self.values[start..start + self.row_width]
    }

    /// Appends the rows with timestamps in `[from, to]` to `out`.
    pub fn collect_range(&self, from: i64, to: i64, out: &mut GroupRows) {
        for (i, &ts) in self.timestamps.iter().enumerate() {
            if ts > to {
                break;
            }
            if ts >= from {
                out.push(ts, self.row(i).to_vec());
            }
        }
    }

    /// Returns the encoded size in the given layout.
    pub fn encoded_len(&self, version: FormatVersion) -> u64 {
        FRAGMENT_HEADER_SIZE + self.row_count() as u64 * version.row_size(self.row_width)
    }

    /// Serialises the fragment in the given layout. A new fragment is always
    /// the tail of its chain, so `next` is written as 0.
    pub fn encode(&self, version: FormatVersion) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len(version) as usize);
        codec::put_offset(&mut buf, 0);
        codec::put_i64(&mut buf, self.start_time_millis);
        codec::put_count(&mut buf, self.row_count(), "row count")?;
        codec::put_count(&mut buf, self.row_width, "row width")?;

        for (i, &ts) in self.timestamps.iter().enumerate() {
            match version {
                FormatVersion::V1 => {
                    codec::put_i64(&mut buf, ts);
                    for &v in self.row(i) {
                        buf.extend_from_slice(&(v as f64).to_be_bytes());
                    }
                }
                FormatVersion::V2 => {
                    let relative = ts
                        .checked_sub(self.start_time_millis)
                        .and_then(|d| i32::try_from(d).ok())
                        .ok_or_else(|| {
                            TsdbError::InvalidArgument(format!(
                                "timestamp {} out of range for fragment starting at {}",
                                ts, self.start_time_millis
                            ))
                        })?;
                    codec::put_i32(&mut buf, relative);
                    for &v in self.row(i) {
                        codec::put_i64(&mut buf, v);
                    }
                }
            }
        }
        Ok(buf)
    }

    /// Appends the fragment at `location` under an exclusive lock on its
    /// range. The fragment is unreachable until a pointer is set to it.
    pub fn write_to(&self, file: &File, location: u64, version: FormatVersion, policy: &IoPolicy) -> Result<()> {
        let buf = self.encode(version)?;
        let _lock = RangeLock::exclusive(file, location, buf.len() as u64, policy.lock_timeout)?;
        Ok(codec::write_all_at(file, location, &buf)?)
    }
}

/// Rewrites the `next` field of the fragment stored at `location`.
pub(crate) fn set_next_at(file: &File, location: u64, offset: u64, policy: &IoPolicy) -> Result<()> {
    // `next` is the first field of the record.
    write_pointer(file, location, offset, policy)
}

/// The fixed prefix of an on-disk fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// File offset of the fragment.
    pub location: u64,
    /// Offset of the next fragment in the chain (0 if tail).
    pub next_data_fragment: u64,
    /// Base of the relative timestamps.
    pub start_time_millis: i64,
    /// Number of rows.
    pub row_count: usize,
    /// Number of values per row.
    pub row_width: usize,
}

impl FragmentHeader {
    /// Reads the 24-byte prefix at `offset` under a shared lock.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::Corrupt` if `offset` does not point into the data
    /// region or a count is negative.
    pub fn read_at(file: &File, offset: u64, data_start: u64, policy: &IoPolicy) -> Result<Self> {
        let file_len = file.metadata()?.len();
        check_record_offset(offset, data_start, file_len, FRAGMENT_HEADER_SIZE)?;

        let _lock = RangeLock::shared(file, offset, FRAGMENT_HEADER_SIZE, policy.lock_timeout)?;
        let mut reader = RecordReader::at(file, offset)?;
        Ok(Self {
            location: offset,
            next_data_fragment: reader.read_offset()?,
            start_time_millis: reader.read_i64()?,
            row_count: reader.read_count("row count")?,
            row_width: reader.read_count("row width")?,
        })
    }

    /// Returns the encoded size of the whole fragment.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::Corrupt` if the counts describe a record larger
    /// than any file can hold.
    pub fn encoded_len(&self, version: FormatVersion) -> Result<u64> {
        (self.row_count as u64)
            .checked_mul(version.row_size(self.row_width))
            .and_then(|rows| rows.checked_add(FRAGMENT_HEADER_SIZE))
            .ok_or_else(|| {
                TsdbError::corrupt(
                    self.location,
                    format!("fragment size overflows: {} rows of width {}", self.row_count, self.row_width),
                )
            })
    }

    fn rows_offset(&self) -> u64 {
        self.location + FRAGMENT_HEADER_SIZE
    }

    /// Returns the end offset of the fragment, checked against the file.
    fn check_extent(&self, file: &File, version: FormatVersion) -> Result<u64> {
        let file_len = file.metadata()?.len();
        let end = self.location.saturating_add(self.encoded_len(version)?);
        if end > file_len {
            return Err(TsdbError::corrupt(
                self.location,
                format!("fragment of {} rows extends past end of file", self.row_count),
            ));
        }
        Ok(end)
    }

    fn decode_timestamp<R: std::io::Read>(&self, reader: &mut RecordReader<R>, version: FormatVersion) -> Result<i64> {
        match version {
            FormatVersion::V1 => reader.read_i64(),
            FormatVersion::V2 => {
                let at = reader.position();
                let relative = reader.read_i32()?;
                self.start_time_millis
                    .checked_add(relative as i64)
                    .ok_or_else(|| TsdbError::corrupt(at, "timestamp overflow"))
            }
        }
    }

    /// Reads the timestamp of the last row without decoding the others.
    pub fn read_last_timestamp(&self, file: &File, version: FormatVersion) -> Result<Option<i64>> {
        if self.row_count == 0 {
            return Ok(None);
        }
        let end = self.check_extent(file, version)?;
        let last_row = end - version.row_size(self.row_width);
        let mut reader = RecordReader::at(file, last_row)?;
        self.decode_timestamp(&mut reader, version).map(Some)
    }

    /// Appends the rows with timestamps in `[from, to]` to `out`, stopping at
    /// the first row after `to`.
    pub(crate) fn scan_rows(
        &self,
        file: &File,
        version: FormatVersion,
        from: i64,
        to: i64,
        out: &mut GroupRows,
    ) -> Result<Scan> {
        if self.row_count == 0 {
            return Ok(Scan::Continue);
        }
        self.check_extent(file, version)?;

        let values_len = 8 * self.row_width as u64;
        let mut reader = RecordReader::at(file, self.rows_offset())?;
        for _ in 0..self.row_count {
            let ts = self.decode_timestamp(&mut reader, version)?;
            if ts > to {
                return Ok(Scan::PastEnd);
            }
            if ts < from {
                reader.skip(values_len)?;
                continue;
            }

            let mut row = Vec::with_capacity(self.row_width);
            for _ in 0..self.row_width {
                let value = match version {
                    FormatVersion::V1 => reader.read_f64()?.round() as i64,
                    FormatVersion::V2 => reader.read_i64()?,
                };
                row.push(value);
            }
            out.push(ts, row);
        }
        Ok(Scan::Continue)
    }
}
