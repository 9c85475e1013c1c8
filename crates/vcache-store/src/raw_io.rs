//! Positional I/O on a shared file handle
//!
//! Blob payload transfers happen outside the metadata mutex on one shared
//! handle per file, so plain seek-then-read would interleave between
//! threads. All access goes through offset-addressed reads and writes
//! (`pread`/`pwrite` on unix, `seek_read`/`seek_write` on Windows), which
//! never touch the handle's seek position.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// A file handle safe to share across threads for positional access
#[derive(Debug)]
pub struct SharedFile {
    file: File,
    path: PathBuf,
}

impl SharedFile {
    /// Wrap an already opened (and locked) handle
    #[must_use]
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            path: path.into(),
        }
    }

    /// Path this handle was opened from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes
    pub fn len(&self) -> io::Result<u64> {
        self.file.metadata().map(|meta| meta.len())
    }

    /// Whether the file is currently empty
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read at `offset`, filling as much of `buf` as the file provides
    ///
    /// Returns the number of bytes read; short counts only occur at
    /// end-of-file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_at_once(offset + filled as u64, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Write all of `data` at `offset`, extending the file if needed
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.write_at_once(offset + written as u64, &data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Extend the file to `size` bytes by writing a single byte at the end
    pub fn presize(&self, size: u64) -> io::Result<()> {
        if size > 0 {
            self.write_at(size - 1, &[0u8])?;
        }
        Ok(())
    }

    /// Flush data and metadata to the device
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    #[cfg(unix)]
    fn read_at_once(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at_once(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek_read(buf, offset)
    }

    #[cfg(unix)]
    fn write_at_once(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.file.write_at(data, offset)
    }

    #[cfg(windows)]
    fn write_at_once(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.file.seek_write(data, offset)
    }
}
