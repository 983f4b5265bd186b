//! File header: magic, format version and free-form metadata.

use super::codec::{self, RecordReader};
use super::toc::TableOfContents;
use super::{FormatVersion, IoPolicy};
use crate::error::{Result, TsdbError};
use crate::lock::RangeLock;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Magic bytes identifying a chronofile database: "TSDB"
pub const MAGIC: [u8; 4] = *b"TSDB";

/// Size of the header up to and including the metadata length.
pub const HEADER_FIXED_SIZE: u64 = 12;

/// File header.
///
/// Written once when the file is created and never modified afterwards.
///
/// ## Binary Layout
///
/// ```text
/// Offset  Size    Field
/// ------  ----    -----
/// 0x00    4       magic "TSDB"
/// 0x04    4       version (i32 BE)
/// 0x08    4       metadata length (i32 BE)
/// 0x0C    N       metadata
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Magic bytes: "TSDB"
    pub magic: [u8; 4],
    /// Layout version of the file.
    pub version: FormatVersion,
    /// Opaque metadata supplied by the creator.
    pub metadata: Vec<u8>,
}

impl FileHeader {
    /// Creates a header for a new file.
    pub fn new(version: FormatVersion, metadata: Vec<u8>) -> Self {
        Self {
            magic: MAGIC,
            version,
            metadata,
        }
    }

    /// Returns the encoded size of the header.
    pub fn encoded_len(&self) -> u64 {
        HEADER_FIXED_SIZE + self.metadata.len() as u64
    }

    /// Returns the offset of the table of contents, which directly follows
    /// the header.
    pub fn toc_offset(&self) -> u64 {
        self.encoded_len()
    }

    /// Writes the header.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata is too large or writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        buf.extend_from_slice(&self.magic);
        codec::put_i32(&mut buf, self.version.as_i32());
        codec::put_blob(&mut buf, &self.metadata)?;
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::InvalidMagic` if the magic bytes don't match.
    /// Returns `TsdbError::UnsupportedVersion` if the version is unknown.
    pub fn read_from<R: Read>(reader: &mut R, file_len: u64) -> Result<Self> {
        let mut reader = RecordReader::new(reader, 0, file_len);

        let magic: [u8; 4] = reader
            .read_exact_vec(4)?
            .try_into()
            .map_err(|_| TsdbError::corrupt(0, "short magic"))?;
        if magic != MAGIC {
            return Err(TsdbError::InvalidMagic(magic));
        }

        let raw_version = reader.read_i32()?;
        let version =
            FormatVersion::from_i32(raw_version).ok_or(TsdbError::UnsupportedVersion(raw_version))?;

        let metadata = reader.read_blob()?;

        Ok(Self {
            magic,
            version,
            metadata,
        })
    }

    /// Writes a new header and an empty table of contents.
    ///
    /// The whole file is locked exclusively while the preamble is written. If
    /// another handle finished creating the file while this one waited for the
    /// lock, the existing header is opened instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired or writing fails.
    pub fn create(file: &File, version: FormatVersion, metadata: &[u8], policy: &IoPolicy) -> Result<Self> {
        {
            let _lock = RangeLock::exclusive(file, 0, 0, policy.lock_timeout)?;
            if file.metadata()?.len() == 0 {
                let header = Self::new(version, metadata.to_vec());
                let toc = TableOfContents::create(header.toc_offset());

                let mut buf = Vec::with_capacity((header.encoded_len() + super::TOC_SIZE) as usize);
                header.write_to(&mut buf)?;
                toc.write_to(&mut buf)?;
                codec::write_all_at(file, 0, &buf)?;
                policy.sync(file)?;

                debug!(
                    "Created database header: version {}, {} metadata bytes",
                    version.as_i32(),
                    metadata.len()
                );
                return Ok(header);
            }
        }
        Self::open(file, policy)
    }

    /// Reads the header of an existing file.
    ///
    /// # Errors
    ///
    /// Returns a format error if the file is not a chronofile database.
    pub fn open(file: &File, policy: &IoPolicy) -> Result<Self> {
        // Taken before the length check so a file still being created reads
        // as contended rather than truncated.
        let _lock = RangeLock::shared(file, 0, HEADER_FIXED_SIZE, policy.lock_timeout)?;
        let file_len = file.metadata()?.len();
        let mut handle = file;
        handle.seek(SeekFrom::Start(0))?;

        if file_len < HEADER_FIXED_SIZE {
            let mut magic = [0u8; 4];
            let n = (file_len as usize).min(magic.len());
            handle.read_exact(&mut magic[..n])?;
            if magic != MAGIC {
                return Err(TsdbError::InvalidMagic(magic));
            }
            return Err(TsdbError::corrupt(
                0,
                format!("file of {} bytes is too short for a header", file_len),
            ));
        }

        Self::read_from(&mut BufReader::new(handle), file_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_size() {
        let header = FileHeader::new(FormatVersion::V2, b"pid=42".to_vec());
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, header.encoded_len());
        assert_eq!(header.toc_offset(), HEADER_FIXED_SIZE + 6);
        assert_eq!(&buf[0..4], b"TSDB");
        assert_eq!(&buf[4..8], &[0, 0, 0, 2]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 6]);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader::new(FormatVersion::V1, vec![0xCA, 0xFE]);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let len = buf.len() as u64;

        let read = FileHeader::read_from(&mut Cursor::new(buf), len).unwrap();
        assert_eq!(header, read);
    }

    #[test]
    fn test_header_invalid_magic() {
        let mut buf = vec![0u8; HEADER_FIXED_SIZE as usize];
        buf[0..4].copy_from_slice(b"XXXX");

        let result = FileHeader::read_from(&mut Cursor::new(buf), HEADER_FIXED_SIZE);
        assert!(matches!(result, Err(TsdbError::InvalidMagic(m)) if &m == b"XXXX"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_during_creation_is_contended() {
        use crate::config::SyncMode;
        use std::fs::OpenOptions;
        use std::time::Duration;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("creating.tsdb");
        let creator = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let reader = File::open(&path).unwrap();
        let policy = IoPolicy {
            lock_timeout: Duration::from_millis(50),
            sync_mode: SyncMode::None,
        };

        // The creator holds the whole file while the preamble is still empty.
        let lock = RangeLock::exclusive(&creator, 0, 0, Duration::ZERO).unwrap();
        let err = FileHeader::open(&reader, &policy).unwrap_err();
        assert!(err.is_contended(), "expected lock timeout, got {:?}", err);
        assert!(!err.is_format_error());
        drop(lock);

        let created = FileHeader::create(&creator, FormatVersion::V2, b"m", &policy).unwrap();
        assert_eq!(FileHeader::open(&reader, &policy).unwrap(), created);
    }

    #[test]
    fn test_header_unsupported_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"TSDB");
        buf.extend_from_slice(&9i32.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());

        let result = FileHeader::read_from(&mut Cursor::new(buf), HEADER_FIXED_SIZE);
        assert!(matches!(result, Err(TsdbError::UnsupportedVersion(9))));
    }
}
