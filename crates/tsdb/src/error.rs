//! Error and Result types for chronofile operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for chronofile operations.
pub type Result<T> = std::result::Result<T, TsdbError>;

/// The error type for database operations.
#[derive(Debug, Error)]
pub enum TsdbError {
    /// Invalid magic bytes in the file header.
    #[error("Invalid magic bytes: expected TSDB, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// The header carries a format version this build cannot decode.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(i32),

    /// A data fragment's row width disagrees with its group's column count.
    #[error("Row width mismatch in group '{group}' at offset {offset}: expected {expected}, got {actual}")]
    RowWidthMismatch {
        /// Name of the owning group.
        group: String,
        /// File offset of the offending fragment.
        offset: u64,
        /// Column count of the group.
        expected: usize,
        /// Row width stored in the fragment.
        actual: usize,
    },

    /// Structural damage: bad offsets, negative counts, malformed strings.
    #[error("Corrupt database at offset {offset}: {reason}")]
    Corrupt {
        /// File offset where the problem was detected.
        offset: u64,
        /// Human readable description.
        reason: String,
    },

    /// A column group with this name already exists.
    #[error("Column group already exists: {0}")]
    DuplicateGroup(String),

    /// No column group with this name exists.
    #[error("Unknown column group: {0}")]
    UnknownGroup(String),

    /// A written row does not have one value per column.
    #[error("Column count mismatch for group '{group}': expected {expected}, got {actual}")]
    ColumnCountMismatch {
        /// Name of the group written to.
        group: String,
        /// Column count of the group.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },

    /// An argument was rejected before any I/O happened.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The database has been closed.
    #[error("Database is closed")]
    Closed,

    /// A mutation was attempted through a read-only handle.
    #[error("Database was opened read-only")]
    ReadOnly,

    /// A byte-range lock could not be acquired in time.
    #[error("Timed out acquiring lock on bytes [{offset}, +{len})")]
    LockTimeout {
        /// Start of the contended range.
        offset: u64,
        /// Length of the contended range (0 means to end of file).
        len: u64,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TsdbError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        TsdbError::Corrupt {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns true if the file is foreign or damaged.
    ///
    /// Format errors are fatal for the open handle and are never worth retrying.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            TsdbError::InvalidMagic(_)
                | TsdbError::UnsupportedVersion(_)
                | TsdbError::RowWidthMismatch { .. }
                | TsdbError::Corrupt { .. }
        )
    }

    /// Returns true if the failure was lock contention rather than damage.
    pub fn is_contended(&self) -> bool {
        matches!(self, TsdbError::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TsdbError::InvalidMagic(*b"XXXX").is_format_error());
        assert!(TsdbError::corrupt(12, "bad").is_format_error());
        assert!(!TsdbError::DuplicateGroup("a".into()).is_format_error());
        assert!(TsdbError::LockTimeout { offset: 0, len: 8 }.is_contended());
        assert!(!TsdbError::Closed.is_contended());
    }

    #[test]
    fn test_error_display() {
        let err = TsdbError::ColumnCountMismatch {
            group: "latency".to_string(),
            expected: 3,
            actual: 2,
        };
        assert!(err.to_string().contains("expected 3, got 2"));

        let err: TsdbError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, TsdbError::IoError(_)));
    }
}
