//! The database façade.
//!
//! [`TimeSeriesDatabase`] owns the file handle, the in-memory index of the
//! ColumnInfo chain, and the rows buffered since the last flush. Every public
//! method runs under one mutex, so a handle can be shared between threads;
//! other handles and processes are kept consistent by byte-range locks.

use crate::config::DatabaseConfig;
use crate::error::{Result, TsdbError};
use crate::format::fragment::{self, Scan, FRAGMENT_HEADER_SIZE};
use crate::format::{
    check_record_offset, ColumnInfo, DataFragment, FileHeader, FormatVersion, FragmentHeader, GroupRows, IoPolicy,
    TableOfContents,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Smallest possible ColumnInfo record: next, empty name, empty metadata,
/// sample time, zero columns, two fragment pointers.
const MIN_COLUMN_INFO_LEN: u64 = 8 + 2 + 4 + 4 + 4 + 16;

/// A single-file time-series database.
///
/// # Example
///
/// ```rust,ignore
/// let db = TimeSeriesDatabase::open("metrics.tsdb", b"host=a")?;
/// db.add_column_group("latency", b"", 1000, &["min", "max", "count"], &[])?;
/// db.write(1_000, "latency", &[3, 17, 42])?;
/// db.flush()?;
/// let rows = db.read("latency", 0, i64::MAX)?;
/// ```
pub struct TimeSeriesDatabase {
    path: PathBuf,
    read_only: bool,
    state: Mutex<Option<DatabaseState>>,
}

/// Everything owned by an open handle. `None` in the façade means closed.
struct DatabaseState {
    file: File,
    header: FileHeader,
    toc: TableOfContents,
    policy: IoPolicy,
    read_only: bool,
    max_rows_per_fragment: usize,
    groups: Vec<GroupState>,
    index: HashMap<String, usize>,
}

struct GroupState {
    info: ColumnInfo,
    /// Buffered fragments, oldest first. Only the back one accepts rows.
    pending: VecDeque<DataFragment>,
    /// Newest accepted timestamp; `None` until loaded from the chain tail.
    last_timestamp: Option<i64>,
    last_timestamp_loaded: bool,
}

impl GroupState {
    fn new(info: ColumnInfo) -> Self {
        Self {
            info,
            pending: VecDeque::new(),
            last_timestamp: None,
            last_timestamp_loaded: false,
        }
    }

    fn pending_rows(&self) -> usize {
        self.pending.iter().map(DataFragment::row_count).sum()
    }
}

/// Stage at which appending a fragment failed.
enum FlushFailure {
    /// Nothing on disk points at the fragment yet; it can be retried.
    Unlinked(TsdbError),
    /// The fragment is reachable; only bookkeeping pointers may be stale.
    Linked(TsdbError),
}

impl TimeSeriesDatabase {
    /// Opens or creates a database with the default configuration.
    ///
    /// `metadata` is stored in the header if the file is created, and ignored
    /// otherwise.
    pub fn open(path: impl AsRef<Path>, metadata: &[u8]) -> Result<Self> {
        Self::open_with_config(path, metadata, DatabaseConfig::default())
    }

    /// Opens or creates a database.
    ///
    /// A writable open creates the file if needed, validates the header,
    /// loads the table of contents and every ColumnInfo, and (unless
    /// disabled) repairs chain tail pointers left stale by a crash. A
    /// read-only open never creates or modifies the file.
    ///
    /// # Errors
    ///
    /// Returns a format error (`InvalidMagic`, `UnsupportedVersion`,
    /// `Corrupt`) if the file is not a valid database; nothing is written to
    /// such a file.
    pub fn open_with_config(path: impl AsRef<Path>, metadata: &[u8], config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .create(!config.read_only)
            .open(&path)?;

        let policy = IoPolicy {
            lock_timeout: config.lock_timeout,
            sync_mode: config.sync_mode,
        };
        let header = if config.read_only {
            FileHeader::open(&file, &policy)?
        } else {
            FileHeader::create(&file, config.format_version, metadata, &policy)?
        };
        let toc = TableOfContents::load(&file, header.toc_offset(), &policy)?;

        let mut state = DatabaseState {
            file,
            header,
            toc,
            policy,
            read_only: config.read_only,
            max_rows_per_fragment: config.max_rows_per_fragment.max(1),
            groups: Vec::new(),
            index: HashMap::new(),
        };
        let first = state.toc.first_column_info();
        state.load_groups(first)?;
        if !config.read_only && config.repair_tails {
            state.repair_tails()?;
        }

        info!(
            "Opened database {} (version {}, {} groups{})",
            path.display(),
            state.header.version.as_i32(),
            state.groups.len(),
            if config.read_only { ", read-only" } else { "" }
        );

        Ok(Self {
            path,
            read_only: config.read_only,
            state: Mutex::new(Some(state)),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DatabaseState) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(TsdbError::Closed)?;
        f(state)
    }

    /// Adds a column group and links it into the ColumnInfo chain.
    ///
    /// `column_meta` is either empty (no per-column metadata) or has one entry
    /// per column.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::DuplicateGroup` if the name exists, before
    /// anything is written.
    pub fn add_column_group<S: AsRef<str>>(
        &self,
        group_name: &str,
        group_meta: &[u8],
        sample_time_millis: i32,
        column_names: &[S],
        column_meta: &[Vec<u8>],
    ) -> Result<()> {
        let column_names: Vec<String> = column_names.iter().map(|s| s.as_ref().to_string()).collect();
        let column_meta = if column_meta.is_empty() {
            vec![Vec::new(); column_names.len()]
        } else {
            column_meta.to_vec()
        };
        let info = ColumnInfo::new(group_name, group_meta.to_vec(), sample_time_millis, column_names, column_meta)?;
        self.with_state(|state| state.add_column_group(info))
    }

    /// Buffers one row for `group_name`. Nothing is written until [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::UnknownGroup`, `TsdbError::ColumnCountMismatch` if
    /// `values` does not have one entry per column, or
    /// `TsdbError::InvalidArgument` if `timestamp` is older than the group's
    /// newest row.
    pub fn write(&self, timestamp: i64, group_name: &str, values: &[i64]) -> Result<()> {
        self.with_state(|state| state.write(timestamp, group_name, values))
    }

    /// Appends every buffered fragment to the file and links it into its
    /// group's chain.
    ///
    /// On failure, fragments that were not yet linked stay buffered and the
    /// flush can be retried.
    pub fn flush(&self) -> Result<()> {
        self.with_state(DatabaseState::flush)
    }

    /// Returns the rows of `group_name` with `from <= timestamp <= to`, in
    /// insertion order. Rows not yet flushed are included.
    pub fn read(&self, group_name: &str, from: i64, to: i64) -> Result<GroupRows> {
        self.with_state(|state| state.read(group_name, from, to))
    }

    /// Returns every group in insertion order.
    pub fn columns_info(&self) -> Result<Vec<ColumnInfo>> {
        self.with_state(|state| Ok(state.groups.iter().map(|g| g.info.clone()).collect()))
    }

    /// Returns the column names of `group_name`.
    pub fn column_names(&self, group_name: &str) -> Result<Vec<String>> {
        self.with_state(|state| Ok(state.group(group_name)?.info.column_names().to_vec()))
    }

    /// Returns the descriptor of `group_name`.
    pub fn column_info(&self, group_name: &str) -> Result<ColumnInfo> {
        self.with_state(|state| Ok(state.group(group_name)?.info.clone()))
    }

    /// Returns the file header.
    pub fn header(&self) -> Result<FileHeader> {
        self.with_state(|state| Ok(state.header.clone()))
    }

    /// Returns the number of rows buffered and not yet flushed.
    pub fn pending_rows(&self) -> Result<usize> {
        self.with_state(|state| Ok(state.groups.iter().map(GroupState::pending_rows).sum()))
    }

    /// Loads groups appended by another handle since this one was opened.
    ///
    /// Returns the number of new groups.
    pub fn refresh(&self) -> Result<usize> {
        self.with_state(DatabaseState::refresh)
    }

    /// Returns the path the database was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if this handle cannot modify the file.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns true until [`close`](Self::close) succeeds.
    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Flushes buffered rows and releases the file.
    ///
    /// If the flush fails the handle stays open and the error is returned.
    /// Every call after a successful close fails with `TsdbError::Closed`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(TsdbError::Closed)?;
        state.flush()?;
        *guard = None;
        info!("Closed database {}", self.path.display());
        Ok(())
    }
}

impl Drop for TimeSeriesDatabase {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.get_mut().take() {
            // Best effort to persist buffered rows
            if let Err(e) = state.flush() {
                warn!("Failed to flush database {} on drop: {:?}", self.path.display(), e);
            }
        }
    }
}

impl DatabaseState {
    fn group(&self, name: &str) -> Result<&GroupState> {
        self.index
            .get(name)
            .map(|&i| &self.groups[i])
            .ok_or_else(|| TsdbError::UnknownGroup(name.to_string()))
    }

    fn group_index(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| TsdbError::UnknownGroup(name.to_string()))
    }

    fn version(&self) -> FormatVersion {
        self.header.version
    }

    fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Upper bound on the length of any fragment chain in the current file.
    fn max_fragment_hops(&self) -> Result<u64> {
        let data_len = self.file_len()?.saturating_sub(self.toc.data_start());
        Ok(data_len / FRAGMENT_HEADER_SIZE + 1)
    }

    fn register(&mut self, info: ColumnInfo) {
        self.index.insert(info.group_name().to_string(), self.groups.len());
        self.groups.push(GroupState::new(info));
    }

    /// Walks the ColumnInfo chain from `offset`, indexing every record.
    fn load_groups(&mut self, mut offset: u64) -> Result<usize> {
        let data_start = self.toc.data_start();
        let mut visited: HashSet<u64> = self.groups.iter().map(|g| g.info.location()).collect();
        let mut loaded = 0;

        while offset != 0 {
            check_record_offset(offset, data_start, self.file_len()?, MIN_COLUMN_INFO_LEN)?;
            if !visited.insert(offset) {
                return Err(TsdbError::corrupt(offset, "cycle in column group chain"));
            }

            let info = ColumnInfo::read_from(&self.file, offset, &self.policy)?;
            if self.index.contains_key(info.group_name()) {
                return Err(TsdbError::corrupt(
                    offset,
                    format!("column group '{}' appears twice", info.group_name()),
                ));
            }
            debug!(
                "Loaded column group '{}' at {} ({} columns)",
                info.group_name(),
                offset,
                info.column_count()
            );
            offset = info.next_column_info();
            self.register(info);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Reads the header of a fragment in group `gi`'s chain, rejecting one
    /// whose rows are not as wide as the group.
    fn fragment_header(&self, gi: usize, offset: u64) -> Result<FragmentHeader> {
        let header = FragmentHeader::read_at(&self.file, offset, self.toc.data_start(), &self.policy)?;
        let info = &self.groups[gi].info;
        if header.row_width != info.column_count() {
            return Err(TsdbError::RowWidthMismatch {
                group: info.group_name().to_string(),
                offset,
                expected: info.column_count(),
                actual: header.row_width,
            });
        }
        Ok(header)
    }

    /// Follows `next` pointers from `start` and returns the last fragment.
    fn walk_to_tail(&self, gi: usize, start: u64) -> Result<u64> {
        let max_hops = self.max_fragment_hops()?;
        let mut current = start;
        let mut hops = 0u64;
        loop {
            let header = self.fragment_header(gi, current)?;
            if header.next_data_fragment == 0 {
                return Ok(current);
            }
            hops += 1;
            if hops > max_hops {
                return Err(TsdbError::corrupt(start, "cycle in data fragment chain"));
            }
            current = header.next_data_fragment;
        }
    }

    /// Advances tail pointers that a crash left behind the true chain tails.
    fn repair_tails(&mut self) -> Result<()> {
        if let Some(last) = self.groups.last() {
            let tail = last.info.location();
            if self.toc.last_column_info() != tail {
                warn!(
                    "Repairing stale column group tail: {} -> {}",
                    self.toc.last_column_info(),
                    tail
                );
                self.toc.set_last_column_info(&self.file, tail, &self.policy)?;
            }
        }

        let mut newest_tail = 0u64;
        let mut oldest_head = 0u64;
        for i in 0..self.groups.len() {
            let info = &self.groups[i].info;
            let head = info.first_data_fragment();
            if head == 0 {
                continue;
            }
            let start = match info.last_data_fragment() {
                0 => head,
                last => last,
            };
            let tail = self.walk_to_tail(i, start)?;
            if tail != info.last_data_fragment() {
                warn!(
                    "Repairing stale fragment tail of group '{}': {} -> {}",
                    info.group_name(),
                    info.last_data_fragment(),
                    tail
                );
                let (file, policy) = (&self.file, &self.policy);
                self.groups[i].info.set_last_data_fragment(file, tail, policy)?;
            }
            newest_tail = newest_tail.max(tail);
            oldest_head = if oldest_head == 0 { head } else { oldest_head.min(head) };
        }

        if self.toc.first_data_fragment() == 0 && oldest_head != 0 {
            self.toc.set_first_data_fragment(&self.file, oldest_head, &self.policy)?;
        }
        if self.toc.last_data_fragment() < newest_tail {
            warn!(
                "Repairing stale global fragment tail: {} -> {}",
                self.toc.last_data_fragment(),
                newest_tail
            );
            self.toc.set_last_data_fragment(&self.file, newest_tail, &self.policy)?;
        }
        Ok(())
    }

    fn add_column_group(&mut self, mut info: ColumnInfo) -> Result<()> {
        if self.read_only {
            return Err(TsdbError::ReadOnly);
        }
        if self.index.contains_key(info.group_name()) {
            return Err(TsdbError::DuplicateGroup(info.group_name().to_string()));
        }

        let location = self.file_len()?;
        info.write_to(&self.file, location, &self.policy)?;
        self.policy.sync(&self.file)?;

        match self.groups.last_mut() {
            Some(prev) => prev.info.set_next_column_info(&self.file, location, &self.policy)?,
            None => self.toc.set_first_column_info(&self.file, location, &self.policy)?,
        }
        debug!("Added column group '{}' at {}", info.group_name(), location);
        // Reachable from here on, so it is indexed even if the TOC update fails.
        self.register(info);

        self.toc.set_last_column_info(&self.file, location, &self.policy)
    }

    fn write(&mut self, timestamp: i64, group_name: &str, values: &[i64]) -> Result<()> {
        if self.read_only {
            return Err(TsdbError::ReadOnly);
        }
        let gi = self.group_index(group_name)?;
        let expected = self.groups[gi].info.column_count();
        if values.len() != expected {
            return Err(TsdbError::ColumnCountMismatch {
                group: group_name.to_string(),
                expected,
                actual: values.len(),
            });
        }

        let last = self.last_timestamp(gi)?;
        if let Some(last) = last {
            if timestamp < last {
                return Err(TsdbError::InvalidArgument(format!(
                    "timestamp {} is older than the newest row of group '{}' ({})",
                    timestamp, group_name, last
                )));
            }
        }

        let version = self.version();
        let max_rows = self.max_rows_per_fragment;
        let group = &mut self.groups[gi];
        let open = group
            .pending
            .back_mut()
            .filter(|f| f.row_count() < max_rows && f.fits(timestamp, version));
        match open {
            Some(fragment) => fragment.push(timestamp, values),
            None => {
                let mut fragment = DataFragment::new(timestamp, expected);
                fragment.push(timestamp, values);
                group.pending.push_back(fragment);
            }
        }
        group.last_timestamp = Some(timestamp);
        Ok(())
    }

    /// Returns the newest timestamp of a group, reading the chain tail the
    /// first time it is needed.
    fn last_timestamp(&mut self, gi: usize) -> Result<Option<i64>> {
        if !self.groups[gi].last_timestamp_loaded {
            let tail = self.groups[gi].info.last_data_fragment();
            let on_disk = if tail == 0 {
                None
            } else {
                self.fragment_header(gi, tail)?
                    .read_last_timestamp(&self.file, self.version())?
            };
            let group = &mut self.groups[gi];
            group.last_timestamp = group.last_timestamp.max(on_disk);
            group.last_timestamp_loaded = true;
        }
        Ok(self.groups[gi].last_timestamp)
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut flushed = 0usize;
        for gi in 0..self.groups.len() {
            while let Some(fragment) = self.groups[gi].pending.pop_front() {
                match self.append_fragment(gi, &fragment) {
                    Ok(()) => flushed += 1,
                    Err(FlushFailure::Unlinked(e)) => {
                        self.groups[gi].pending.push_front(fragment);
                        return Err(e);
                    }
                    Err(FlushFailure::Linked(e)) => return Err(e),
                }
            }
        }
        if flushed > 0 {
            debug!("Flushed {} data fragments", flushed);
        }
        Ok(())
    }

    /// Writes one fragment at the end of the file and links it.
    ///
    /// The fragment is fully written and synced before anything points at
    /// it. The group's tail pointer and the TOC are updated only after the
    /// chain link, so a crash leaves at worst a stale tail, which
    /// [`repair_tails`](Self::repair_tails) fixes on the next open.
    fn append_fragment(&mut self, gi: usize, fragment: &DataFragment) -> std::result::Result<(), FlushFailure> {
        let version = self.version();
        let location = self.file_len().map_err(FlushFailure::Unlinked)?;
        fragment
            .write_to(&self.file, location, version, &self.policy)
            .and_then(|()| self.policy.sync(&self.file))
            .map_err(FlushFailure::Unlinked)?;

        let recorded_tail = self.groups[gi].info.last_data_fragment();
        let link = if recorded_tail != 0 {
            self.walk_to_tail(gi, recorded_tail)
                .and_then(|tail| fragment::set_next_at(&self.file, tail, location, &self.policy))
        } else {
            let (file, policy) = (&self.file, &self.policy);
            self.groups[gi].info.set_first_data_fragment(file, location, policy)
        };
        link.map_err(FlushFailure::Unlinked)?;

        let (file, policy) = (&self.file, &self.policy);
        let linked = self.groups[gi]
            .info
            .set_last_data_fragment(file, location, policy)
            .and_then(|()| {
                if self.toc.first_data_fragment() == 0 {
                    self.toc.set_first_data_fragment(file, location, policy)?;
                }
                self.toc.set_last_data_fragment(file, location, policy)
            })
            .and_then(|()| policy.sync(file));
        linked.map_err(FlushFailure::Linked)?;

        debug!(
            "Appended fragment of {} rows for group '{}' at {}",
            fragment.row_count(),
            self.groups[gi].info.group_name(),
            location
        );
        Ok(())
    }

    fn read(&mut self, group_name: &str, from: i64, to: i64) -> Result<GroupRows> {
        let gi = self.group_index(group_name)?;
        let mut out = GroupRows::default();
        if from > to {
            return Ok(out);
        }
        if self.read_only {
            let (file, policy) = (&self.file, &self.policy);
            self.groups[gi].info.reload_pointers(file, policy)?;
        }

        let group = &self.groups[gi];
        let version = self.version();
        let max_hops = self.max_fragment_hops()?;

        let mut offset = group.info.first_data_fragment();
        let mut hops = 0u64;
        while offset != 0 {
            hops += 1;
            if hops > max_hops {
                return Err(TsdbError::corrupt(
                    group.info.first_data_fragment(),
                    format!("cycle in data fragment chain of group '{}'", group_name),
                ));
            }

            let header = self.fragment_header(gi, offset)?;
            if header.start_time_millis > to {
                break;
            }
            let before_range = match header.read_last_timestamp(&self.file, version)? {
                Some(last) => last < from,
                None => true,
            };
            if !before_range && header.scan_rows(&self.file, version, from, to, &mut out)? == Scan::PastEnd {
                break;
            }
            offset = header.next_data_fragment;
        }

        for fragment in &group.pending {
            fragment.collect_range(from, to, &mut out);
        }
        Ok(out)
    }

    fn refresh(&mut self) -> Result<usize> {
        self.toc = TableOfContents::load(&self.file, self.toc.location(), &self.policy)?;
        let start = match self.groups.last_mut() {
            Some(last) => {
                last.info.reload_pointers(&self.file, &self.policy)?;
                last.info.next_column_info()
            }
            None => self.toc.first_column_info(),
        };
        let loaded = self.load_groups(start)?;
        if loaded > 0 {
            info!("Refreshed database: {} new column groups", loaded);
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> DatabaseConfig {
        DatabaseConfig::new(SyncMode::None, Duration::from_millis(200))
    }

    #[test]
    fn test_database_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TimeSeriesDatabase>();
    }

    #[test]
    fn test_fragments_seal_at_row_limit() {
        let dir = TempDir::new().unwrap();
        let config = fast_config().with_max_rows_per_fragment(2);
        let db = TimeSeriesDatabase::open_with_config(dir.path().join("seal.tsdb"), b"", config).unwrap();
        db.add_column_group("g", b"", 10, &["v"], &[]).unwrap();
        for ts in 0..5 {
            db.write(ts, "g", &[ts * 10]).unwrap();
        }

        let guard = db.state.lock();
        let state = guard.as_ref().unwrap();
        let counts: Vec<usize> = state.groups[0].pending.iter().map(DataFragment::row_count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_failed_link_keeps_fragment_pending() {
        let dir = TempDir::new().unwrap();
        let db = TimeSeriesDatabase::open_with_config(dir.path().join("retry.tsdb"), b"", fast_config()).unwrap();
        db.add_column_group("g", b"", 10, &["v"], &[]).unwrap();
        db.write(1, "g", &[1]).unwrap();
        db.flush().unwrap();
        db.write(2, "g", &[2]).unwrap();

        {
            // Point the recorded tail into the header so linking fails.
            let mut guard = db.state.lock();
            let state = guard.as_mut().unwrap();
            let (file, policy) = (&state.file, &state.policy);
            state.groups[0].info.set_last_data_fragment(file, 4, policy).unwrap();
        }
        assert!(matches!(db.flush(), Err(TsdbError::Corrupt { .. })));
        assert_eq!(db.pending_rows().unwrap(), 1);
    }
}
