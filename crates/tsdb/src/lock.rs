//! Advisory byte-range locks.
//!
//! Every structural read or write of the database file happens while holding a
//! [`RangeLock`] over exactly the bytes involved. The guard releases its range
//! when dropped, so an early return through `?` can never leak a lock.
//!
//! On Linux the locks are open-file-description locks (`F_OFD_SETLK`): they
//! belong to the file handle rather than the process, so two handles opened on
//! the same file inside one process contend with each other exactly like two
//! processes would. Other Unix targets fall back to classic POSIX record locks.
//! Non-Unix targets do not lock at all.
//!
//! Acquisition never blocks inside the kernel. A contended range is retried
//! with a short backoff until the configured timeout elapses, after which
//! [`TsdbError::LockTimeout`] is returned.

use crate::error::{Result, TsdbError};
use std::fs::File;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Initial sleep between attempts on a contended range.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// Upper bound for the sleep between attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Lock mode for a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock; any number of readers may hold overlapping ranges.
    Shared,
    /// Exclusive lock; conflicts with every other lock on the range.
    Exclusive,
}

/// A held advisory lock over `[offset, offset + len)` of a file.
///
/// A `len` of zero covers everything from `offset` to the end of the file,
/// including bytes appended later.
#[derive(Debug)]
pub struct RangeLock<'a> {
    file: &'a File,
    offset: u64,
    len: u64,
    mode: LockMode,
}

impl<'a> RangeLock<'a> {
    /// Acquires a lock, retrying until `timeout` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns `TsdbError::LockTimeout` if the range stays contended, or an
    /// I/O error if the lock call itself fails.
    pub fn acquire(
        file: &'a File,
        offset: u64,
        len: u64,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if sys::try_lock(file, offset, len, mode)? {
                return Ok(Self {
                    file,
                    offset,
                    len,
                    mode,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Lock on bytes [{}, +{}) still contended after {:?}",
                    offset, len, timeout
                );
                return Err(TsdbError::LockTimeout { offset, len });
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Acquires a shared lock.
    pub fn shared(file: &'a File, offset: u64, len: u64, timeout: Duration) -> Result<Self> {
        Self::acquire(file, offset, len, LockMode::Shared, timeout)
    }

    /// Acquires an exclusive lock.
    pub fn exclusive(file: &'a File, offset: u64, len: u64, timeout: Duration) -> Result<Self> {
        Self::acquire(file, offset, len, LockMode::Exclusive, timeout)
    }

    /// Returns the start of the locked range.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the length of the locked range (0 means to end of file).
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the lock covers the rest of the file.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the mode the lock was taken in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for RangeLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = sys::unlock(self.file, self.offset, self.len) {
            error!(
                "Failed to release {:?} lock on bytes [{}, +{}): {}",
                self.mode, self.offset, self.len, e
            );
        }
    }
}

#[cfg(unix)]
mod sys {
    use super::LockMode;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    #[cfg(target_os = "linux")]
    const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
    #[cfg(not(target_os = "linux"))]
    const SET_LOCK: libc::c_int = libc::F_SETLK;

    fn set_lock(file: &File, offset: u64, len: u64, lock_type: libc::c_short) -> io::Result<()> {
        let start = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "lock offset out of range"))?;
        let length = libc::off_t::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "lock length out of range"))?;

        // SAFETY: `flock` is a plain C struct; all-zero is a valid value and
        // OFD locks require `l_pid == 0`.
        let mut request: libc::flock = unsafe { std::mem::zeroed() };
        request.l_type = lock_type;
        request.l_whence = libc::SEEK_SET as libc::c_short;
        request.l_start = start;
        request.l_len = length;

        // SAFETY: the descriptor is owned by `file` and stays open for the
        // duration of the call; `request` outlives it.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), SET_LOCK, &request as *const libc::flock) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn is_contention(err: &io::Error) -> bool {
        let errno = err.raw_os_error().unwrap_or_default();
        errno == libc::EAGAIN || errno == libc::EACCES || errno == libc::EWOULDBLOCK
    }

    pub(super) fn try_lock(file: &File, offset: u64, len: u64, mode: LockMode) -> io::Result<bool> {
        let lock_type = match mode {
            LockMode::Shared => libc::F_RDLCK,
            LockMode::Exclusive => libc::F_WRLCK,
        };
        match set_lock(file, offset, len, lock_type as libc::c_short) {
            Ok(()) => Ok(true),
            Err(e) if is_contention(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(super) fn unlock(file: &File, offset: u64, len: u64) -> io::Result<()> {
        set_lock(file, offset, len, libc::F_UNLCK as libc::c_short)
    }
}

#[cfg(not(unix))]
mod sys {
    use super::LockMode;
    use std::fs::File;
    use std::io;

    pub(super) fn try_lock(_file: &File, _offset: u64, _len: u64, _mode: LockMode) -> io::Result<bool> {
        Ok(true)
    }

    pub(super) fn unlock(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open_pair(dir: &TempDir) -> (File, File) {
        let path = dir.path().join("locks.tsdb");
        let a = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let b = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        (a, b)
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let (a, b) = open_pair(&dir);

        let _first = RangeLock::shared(&a, 0, 32, Duration::ZERO).unwrap();
        let second = RangeLock::shared(&b, 8, 8, Duration::ZERO).unwrap();
        assert_eq!(second.mode(), LockMode::Shared);
    }

    #[test]
    fn test_exclusive_conflict_times_out() {
        let dir = TempDir::new().unwrap();
        let (a, b) = open_pair(&dir);

        let held = RangeLock::exclusive(&a, 100, 8, Duration::ZERO).unwrap();
        let result = RangeLock::shared(&b, 104, 4, Duration::from_millis(20));
        assert!(matches!(
            result,
            Err(TsdbError::LockTimeout {
                offset: 104,
                len: 4
            })
        ));

        // Disjoint ranges never conflict.
        let disjoint = RangeLock::exclusive(&b, 108, 8, Duration::ZERO).unwrap();
        assert_eq!(disjoint.offset(), 108);

        drop(held);
        let retaken = RangeLock::exclusive(&b, 100, 8, Duration::ZERO).unwrap();
        assert_eq!(retaken.len(), 8);
    }

    #[test]
    fn test_whole_file_lock_blocks_any_range() {
        let dir = TempDir::new().unwrap();
        let (a, b) = open_pair(&dir);

        let whole = RangeLock::exclusive(&a, 0, 0, Duration::ZERO).unwrap();
        assert!(whole.is_empty());
        assert!(RangeLock::shared(&b, 1 << 20, 8, Duration::ZERO).is_err());
    }
}
