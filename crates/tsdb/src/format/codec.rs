//! Big-endian primitives and modified UTF-8 strings.
//!
//! Strings are stored as a 2-byte big-endian length followed by modified
//! UTF-8: the NUL character is written as `C0 80` and characters outside the
//! Basic Multilingual Plane are written as two 3-byte surrogate encodings.

use crate::error::{Result, TsdbError};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};

/// Maximum encoded length of a string field.
pub const MAX_UTF_LEN: usize = u16::MAX as usize;

/// Encodes a string as modified UTF-8 (without the length prefix).
pub fn encode_modified_utf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

/// Decodes modified UTF-8 bytes. Returns `None` on malformed input.
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let c = *bytes.get(i + 1)?;
            if c & 0xC0 != 0x80 {
                return None;
            }
            units.push(((b as u16 & 0x1F) << 6) | (c as u16 & 0x3F));
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let c1 = *bytes.get(i + 1)?;
            let c2 = *bytes.get(i + 2)?;
            if c1 & 0xC0 != 0x80 || c2 & 0xC0 != 0x80 {
                return None;
            }
            units.push(((b as u16 & 0x0F) << 12) | ((c1 as u16 & 0x3F) << 6) | (c2 as u16 & 0x3F));
            i += 3;
        } else {
            return None;
        }
    }
    String::from_utf16(&units).ok()
}

/// Returns the encoded size of a string field including its length prefix.
pub fn utf_field_len(s: &str) -> usize {
    2 + encode_modified_utf8(s).len()
}

pub(crate) fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_offset(buf: &mut Vec<u8>, offset: u64) {
    put_i64(buf, offset as i64);
}

pub(crate) fn put_count(buf: &mut Vec<u8>, count: usize, what: &str) -> Result<()> {
    let count = i32::try_from(count)
        .map_err(|_| TsdbError::InvalidArgument(format!("{} too large: {}", what, count)))?;
    put_i32(buf, count);
    Ok(())
}

/// Writes an i32 length prefix followed by the bytes.
pub(crate) fn put_blob(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    put_count(buf, bytes.len(), "blob length")?;
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Writes a u16 length prefix followed by modified UTF-8.
pub(crate) fn put_utf(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let encoded = encode_modified_utf8(s);
    if encoded.len() > MAX_UTF_LEN {
        return Err(TsdbError::InvalidArgument(format!(
            "string of {} encoded bytes exceeds {}",
            encoded.len(),
            MAX_UTF_LEN
        )));
    }
    buf.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
    buf.extend_from_slice(&encoded);
    Ok(())
}

/// Writes `bytes` at an absolute file offset.
pub(crate) fn write_all_at(file: &File, offset: u64, bytes: &[u8]) -> io::Result<()> {
    let mut handle = file;
    handle.seek(SeekFrom::Start(offset))?;
    handle.write_all(bytes)?;
    handle.flush()
}

/// Sequential reader over one record that tracks its absolute file position.
///
/// Reads past `end` fail with `UnexpectedEof` before touching the source, and
/// length-prefixed fields longer than the remaining bytes are reported as
/// corruption instead of being allocated.
pub(crate) struct RecordReader<R> {
    inner: R,
    pos: u64,
    end: u64,
}

impl<'a> RecordReader<BufReader<&'a File>> {
    /// Positions a buffered reader at `offset` in `file`.
    pub(crate) fn at(file: &'a File, offset: u64) -> Result<Self> {
        let end = file.metadata()?.len();
        if offset >= end {
            return Err(TsdbError::corrupt(offset, format!("offset beyond end of file ({})", end)));
        }
        let mut handle = file;
        handle.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            inner: BufReader::new(handle),
            pos: offset,
            end,
        })
    }

    /// Skips `n` bytes without reading them.
    pub(crate) fn skip(&mut self, n: u64) -> Result<()> {
        self.check_remaining(n)?;
        let delta = i64::try_from(n).map_err(|_| TsdbError::corrupt(self.pos, "skip too large"))?;
        self.inner.seek_relative(delta)?;
        self.pos += n;
        Ok(())
    }
}

impl<R: Read> RecordReader<R> {
    pub(crate) fn new(inner: R, pos: u64, end: u64) -> Self {
        Self { inner, pos, end }
    }

    /// Returns the absolute position of the next byte to be read.
    pub(crate) fn position(&self) -> u64 {
        self.pos
    }

    fn check_remaining(&self, n: u64) -> Result<()> {
        if self.pos.saturating_add(n) > self.end {
            return Err(TsdbError::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("record at {} truncated: need {} bytes", self.pos, n),
            )));
        }
        Ok(())
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_remaining(buf.len() as u64)?;
        self.inner.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(f64::from_be_bytes(buf))
    }

    pub(crate) fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.fill(&mut out)?;
        Ok(out)
    }

    /// Reads an 8-byte file offset; negative values are corruption.
    pub(crate) fn read_offset(&mut self) -> Result<u64> {
        let at = self.pos;
        let raw = self.read_i64()?;
        u64::try_from(raw).map_err(|_| TsdbError::corrupt(at, format!("negative offset {}", raw)))
    }

    /// Reads an i32 count; negative values are corruption.
    pub(crate) fn read_count(&mut self, what: &str) -> Result<usize> {
        let at = self.pos;
        let raw = self.read_i32()?;
        usize::try_from(raw).map_err(|_| TsdbError::corrupt(at, format!("negative {}: {}", what, raw)))
    }

    pub(crate) fn read_blob(&mut self) -> Result<Vec<u8>> {
        let at = self.pos;
        let len = self.read_count("blob length")?;
        if self.pos + len as u64 > self.end {
            return Err(TsdbError::corrupt(at, format!("blob length {} exceeds file", len)));
        }
        self.read_exact_vec(len)
    }

    pub(crate) fn read_utf(&mut self) -> Result<String> {
        let at = self.pos;
        let len = self.read_u16()? as usize;
        let bytes = self.read_exact_vec(len)?;
        decode_modified_utf8(&bytes).ok_or_else(|| TsdbError::corrupt(at, "malformed modified UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ascii_is_plain_utf8() {
        assert_eq!(encode_modified_utf8("latency"), b"latency".to_vec());
        assert_eq!(utf_field_len("min"), 5);
    }

    #[test]
    fn test_nul_and_supplementary_encoding() {
        assert_eq!(encode_modified_utf8("\0"), vec![0xC0, 0x80]);
        // U+1F600 becomes a surrogate pair, 3 bytes each.
        let encoded = encode_modified_utf8("\u{1F600}");
        assert_eq!(encoded, vec![0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]);
        assert_eq!(decode_modified_utf8(&encoded).unwrap(), "\u{1F600}");

        let mixed = "a\0é€\u{10348}z";
        assert_eq!(decode_modified_utf8(&encode_modified_utf8(mixed)).unwrap(), mixed);
    }

    #[test]
    fn test_malformed_utf_rejected() {
        assert!(decode_modified_utf8(&[0xC0]).is_none());
        assert!(decode_modified_utf8(&[0xE0, 0x80, 0x41]).is_none());
        assert!(decode_modified_utf8(&[0xF0, 0x9F, 0x98, 0x80]).is_none());
        // Lone high surrogate.
        assert!(decode_modified_utf8(&[0xED, 0xA0, 0xBD]).is_none());
    }

    #[test]
    fn test_put_utf_rejects_oversized() {
        let long = "x".repeat(MAX_UTF_LEN + 1);
        let mut buf = Vec::new();
        assert!(matches!(put_utf(&mut buf, &long), Err(TsdbError::InvalidArgument(_))));
    }

    #[test]
    fn test_record_reader_tracks_position() {
        let mut buf = Vec::new();
        put_i32(&mut buf, 7);
        put_utf(&mut buf, "cpu").unwrap();
        put_blob(&mut buf, &[1, 2, 3]).unwrap();
        put_i64(&mut buf, -5);
        let len = buf.len() as u64;

        let mut reader = RecordReader::new(Cursor::new(buf), 100, 100 + len);
        assert_eq!(reader.read_i32().unwrap(), 7);
        assert_eq!(reader.read_utf().unwrap(), "cpu");
        assert_eq!(reader.read_blob().unwrap(), vec![1, 2, 3]);
        assert_eq!(reader.position(), 100 + len - 8);
        assert!(matches!(reader.read_offset(), Err(TsdbError::Corrupt { .. })));
    }

    #[test]
    fn test_record_reader_truncation_is_eof() {
        let mut reader = RecordReader::new(Cursor::new(vec![0u8; 3]), 0, 3);
        match reader.read_i32() {
            Err(TsdbError::IoError(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected EOF, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_blob_is_corrupt() {
        let mut buf = Vec::new();
        put_i32(&mut buf, 1_000_000);
        buf.extend_from_slice(&[0u8; 4]);
        let mut reader = RecordReader::new(Cursor::new(buf), 0, 8);
        assert!(matches!(reader.read_blob(), Err(TsdbError::Corrupt { .. })));
    }
}
