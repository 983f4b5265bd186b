//! Database configuration.

use crate::format::FormatVersion;
use std::time::Duration;

/// Default time to wait for a contended byte-range lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of rows after which an in-memory fragment is sealed.
pub const DEFAULT_MAX_ROWS_PER_FRAGMENT: usize = 8192;

/// Sync mode for durability of appended records and pointer updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync after each durable step (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

impl SyncMode {
    pub(crate) fn sync(self, file: &std::fs::File) -> std::io::Result<()> {
        match self {
            SyncMode::Fsync => file.sync_all(),
            SyncMode::Fdatasync => file.sync_data(),
            SyncMode::None => Ok(()),
        }
    }
}

/// Configuration for opening a [`TimeSeriesDatabase`](crate::TimeSeriesDatabase).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Layout used when a new file is created. Existing files keep their own.
    pub format_version: FormatVersion,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
    /// How long to retry a contended byte-range lock. Zero fails fast.
    pub lock_timeout: Duration,
    /// Rows buffered in one fragment before it is sealed.
    pub max_rows_per_fragment: usize,
    /// Open without write access; mutations fail with `ReadOnly`.
    pub read_only: bool,
    /// Advance stale group tail pointers left by an interrupted flush.
    pub repair_tails: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            format_version: FormatVersion::default(),
            sync_mode: SyncMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_rows_per_fragment: DEFAULT_MAX_ROWS_PER_FRAGMENT,
            read_only: false,
            repair_tails: true,
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration with custom durability and locking settings.
    pub fn new(sync_mode: SyncMode, lock_timeout: Duration) -> Self {
        Self {
            sync_mode,
            lock_timeout,
            ..Self::default()
        }
    }

    /// Returns a read-only variant of this configuration.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Sets the layout used for newly created files.
    pub fn with_format_version(mut self, version: FormatVersion) -> Self {
        self.format_version = version;
        self
    }

    /// Sets the fragment sealing threshold.
    pub fn with_max_rows_per_fragment(mut self, rows: usize) -> Self {
        self.max_rows_per_fragment = rows.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.sync_mode, SyncMode::Fsync);
        assert_eq!(config.format_version, FormatVersion::V2);
        assert!(!config.read_only);
        assert!(config.repair_tails);
    }

    #[test]
    fn test_builder_clamps_fragment_rows() {
        let config = DatabaseConfig::new(SyncMode::None, Duration::ZERO)
            .with_max_rows_per_fragment(0)
            .read_only();
        assert_eq!(config.max_rows_per_fragment, 1);
        assert!(config.read_only);
        assert_eq!(config.lock_timeout, Duration::ZERO);
    }
}
