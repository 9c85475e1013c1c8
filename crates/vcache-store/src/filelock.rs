//! Advisory whole-file locks
//!
//! One writable opener per store, any number of read-only openers. Two
//! regimes exist behind the same interface: POSIX whole-file `flock` taken
//! non-blocking after open, and Windows share modes passed at open time.
//!
//! Locks are never released explicitly on POSIX. An explicit unlock from a
//! forked child would revoke the parent's hold; closing the descriptor
//! releases the lock once every duplicate is gone.

use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// Requested lock strength
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Other readers may coexist
    Shared,
    /// Sole opener
    Exclusive,
}

/// Open an existing file and acquire the advisory lock, non-blocking
///
/// Returns `None` when the file is missing or another opener holds a
/// conflicting lock.
pub fn open_existing(path: &Path, writable: bool, mode: LockMode) -> Option<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(writable);
    configure_share_mode(&mut options, mode);

    let file = match options.open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("open {} failed: {}", path.display(), e);
            return None;
        }
    };

    if !try_lock(&file, mode) {
        debug!("lock conflict on {}", path.display());
        return None;
    }

    Some(file)
}

/// Create (or truncate) a file and acquire the exclusive lock
///
/// An existing file is probed with a non-destructive read-only open first,
/// so a file held by another opener is never truncated.
pub fn create_locked(path: &Path) -> Option<File> {
    if path.exists() {
        let probe = OpenOptions::new().read(true).open(path).ok()?;
        if !try_lock(&probe, LockMode::Exclusive) {
            debug!("lock conflict probing {}", path.display());
            return None;
        }
        // probe descriptor closes here, releasing the probe lock
    }

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(true);
    configure_share_mode(&mut options, LockMode::Exclusive);

    let file = match options.open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("create {} failed: {}", path.display(), e);
            return None;
        }
    };

    if !try_lock(&file, LockMode::Exclusive) {
        return None;
    }

    Some(file)
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> bool {
    use std::os::unix::io::AsRawFd;

    let operation = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    } | libc::LOCK_NB;

    // SAFETY: flock on an owned, open descriptor.
    unsafe { libc::flock(file.as_raw_fd(), operation) == 0 }
}

#[cfg(windows)]
fn try_lock(_file: &File, _mode: LockMode) -> bool {
    // Share modes passed at open time already enforce the lock.
    true
}

#[cfg(unix)]
fn configure_share_mode(_options: &mut OpenOptions, _mode: LockMode) {}

#[cfg(windows)]
fn configure_share_mode(options: &mut OpenOptions, mode: LockMode) {
    use std::os::windows::fs::OpenOptionsExt;

    const FILE_SHARE_READ: u32 = 0x0000_0001;
    match mode {
        // deny writers, admit other readers
        LockMode::Shared => options.share_mode(FILE_SHARE_READ),
        // deny everyone
        LockMode::Exclusive => options.share_mode(0),
    };
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_exclusive_excludes_second_opener() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let first = create_locked(&path).unwrap();
        assert!(open_existing(&path, true, LockMode::Exclusive).is_none());
        assert!(open_existing(&path, false, LockMode::Shared).is_none());

        drop(first);
        assert!(open_existing(&path, true, LockMode::Exclusive).is_some());
    }

    #[test]
    fn test_shared_readers_coexist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");
        drop(create_locked(&path).unwrap());

        let first = open_existing(&path, false, LockMode::Shared).unwrap();
        let second = open_existing(&path, false, LockMode::Shared);
        assert!(second.is_some());

        // a writer cannot join while readers hold the file
        assert!(open_existing(&path, true, LockMode::Exclusive).is_none());
        drop(first);
    }

    #[test]
    fn test_create_probe_spares_locked_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let holder = create_locked(&path).unwrap();
        holder.set_len(4096).unwrap();

        // a second create must fail the probe and leave the file intact
        assert!(create_locked(&path).is_none());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.dat");
        assert!(open_existing(&path, false, LockMode::Shared).is_none());
    }
}
