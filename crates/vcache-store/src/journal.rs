//! Index journal: the packed record file and its hole list
//!
//! Records live at implicit offsets (multiples of the record size). A
//! removed blob leaves a tombstone of zero bytes; the offset goes onto an
//! in-memory FIFO and is handed to the next block that needs persisting,
//! so the index file only grows when no hole is available.
//!
//! The journal is written under the store's metadata mutex. Write failures
//! are logged and swallowed; the in-memory state stays authoritative and
//! an audit pass will surface the divergence.

use crate::block::{FileBlock, RECORD_SIZE};
use crate::raw_io::SharedFile;
use std::collections::VecDeque;
use tracing::error;

/// The index file plus its reuse bookkeeping
#[derive(Debug)]
pub struct IndexJournal {
    file: SharedFile,
    /// Offset one past the last record
    end: u64,
    /// Tombstoned offsets, reused FIFO
    holes: VecDeque<u64>,
}

impl IndexJournal {
    /// Wrap a locked index file; `end` is the offset past the last record
    #[must_use]
    pub fn new(file: SharedFile, end: u64) -> Self {
        Self {
            file,
            end,
            holes: VecDeque::new(),
        }
    }

    /// The underlying file handle (the audit pass re-reads it)
    #[must_use]
    pub fn file(&self) -> &SharedFile {
        &self.file
    }

    /// Offset one past the last record
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Record a tombstoned or skipped offset for reuse
    pub fn record_hole(&mut self, offset: u64) {
        self.holes.push_back(offset);
    }

    /// Number of reusable holes
    #[must_use]
    pub fn hole_count(&self) -> usize {
        self.holes.len()
    }

    /// Whether `offset` is currently on the hole list
    #[must_use]
    pub fn is_hole(&self, offset: u64) -> bool {
        self.holes.contains(&offset)
    }

    /// Write a tombstone at a known offset (recovery path)
    pub fn tombstone(&mut self, offset: u64) {
        self.holes.push_back(offset);
        if let Err(e) = self.file.write_at(offset, &[0u8; RECORD_SIZE]) {
            error!(
                "tombstone write at {} in {} failed: {}",
                offset,
                self.file.path().display(),
                e
            );
        }
    }

    /// Persist one block's record, or tombstone it when `remove` is set
    ///
    /// An unsaved block takes the oldest hole, or appends when none exists.
    /// Dummies are never persisted. Syncing a zero-length block is a
    /// programming error.
    ///
    /// # Panics
    /// Panics if the block's length is zero.
    pub fn sync(&mut self, block: &mut FileBlock, remove: bool) {
        if block.is_dummy() {
            return;
        }
        assert!(block.length != 0, "syncing zero-length block {}", block.key);

        let offset = match block.index_location {
            Some(offset) => offset,
            None => self.holes.pop_front().unwrap_or_else(|| {
                let offset = self.end;
                self.end += RECORD_SIZE as u64;
                offset
            }),
        };
        block.index_location = Some(offset);

        if remove {
            self.holes.push_back(offset);
        }

        let record = if remove {
            [0u8; RECORD_SIZE]
        } else {
            block.encode()
        };
        if let Err(e) = self.file.write_at(offset, &record) {
            error!(
                "index write for {} at {} in {} failed: {}",
                block.key,
                offset,
                self.file.path().display(),
                e
            );
        }
    }
}
