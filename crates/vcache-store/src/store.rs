//! The asset store: blob table, allocation, eviction and lifecycle
//!
//! One `Store` owns a locked data file and a locked index file. All
//! metadata (the blob table, the free list, the journal) sits behind a
//! single mutex; blob payload transfers snapshot `(location, size)` under
//! the mutex and then run against the shared data handle without it.
//!
//! Opening recovers from whatever the previous run left behind: gaps
//! between blocks become free regions, tombstoned records become reusable
//! holes, duplicate records are dropped, and anything worse discards the
//! store. A crash marker file distinguishes a clean shutdown from one that
//! never reached close.

use crate::block::{
    ALTERNATE_LIMIT, BLOCK_MASK, CLEANUP_TARGET, DEFAULT_FRESH_SIZE, DiskRecord, FileBlock,
    INVALID_LENGTH, LockKind, RECORD_SIZE, round_to_block,
};
use crate::filelock::{self, LockMode};
use crate::freelist::FreeList;
use crate::journal::IndexJournal;
use crate::raw_io::SharedFile;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use vcache_common::{BlobKey, Error, Result, StoreConfig};

/// Mutex-protected store metadata
pub(crate) struct State {
    pub(crate) blocks: BTreeMap<BlobKey, FileBlock>,
    pub(crate) free: FreeList,
    pub(crate) journal: IndexJournal,
}

/// A single-host virtual file store for immutable typed assets
pub struct Store {
    pub(crate) state: Mutex<State>,
    pub(crate) data: SharedFile,
    read_only: bool,
    remove_after_crash: bool,
    index_path: PathBuf,
    data_path: PathBuf,
}

/// `<path>.<n>` alternate for a file pair that cannot be locked
fn numbered(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// `<data_path>.open`, present only while a writable store is open
fn marker_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(".open");
    PathBuf::from(name)
}

impl Store {
    /// Open or create a store
    ///
    /// The returned store is valid until dropped. Failure modes:
    /// [`Error::CannotOpenReadOnly`] when a read-only open finds no store or
    /// cannot share the lock, [`Error::CannotCreate`] when no file pair can
    /// be locked for writing, and [`Error::Corrupt`] when the on-disk state
    /// is inconsistent; the files are deleted and a re-open starts fresh.
    pub fn open(config: StoreConfig) -> Result<Store> {
        let (mut data, index_path, data_path, created) = Self::open_data_file(&config)?;
        if created && config.presize > 0 {
            data.presize(u64::from(config.presize))?;
            info!("pre-sized data file to {} bytes", config.presize);
        }

        // Did the last run leave this store open for writing? If so the
        // contents cannot be trusted; start over.
        let marker = marker_path(&data_path);
        if !config.read_only && config.remove_after_crash && marker.exists() {
            warn!(
                "store left open on last run, removing old files at {}",
                data_path.display()
            );
            drop(data);
            let _ = fs::remove_file(&index_path);
            let _ = fs::remove_file(&data_path);
            let _ = fs::remove_file(&marker);

            let file = filelock::create_locked(&data_path).ok_or_else(|| {
                warn!("can't recreate data file in crash recovery");
                Error::cannot_create(data_path.display().to_string())
            })?;
            data = SharedFile::new(file, &data_path);
            if config.presize > 0 {
                data.presize(u64::from(config.presize))?;
            }
        }

        let data_size = data.len()? as u32;
        let (data, blocks, free, journal) =
            Self::load_index(data, data_size, &index_path, &data_path, config.read_only)?;

        if !config.read_only && config.remove_after_crash {
            if let Err(e) = fs::File::create(&marker) {
                warn!("can't create crash marker {}: {}", marker.display(), e);
            }
        }

        info!(
            "store using index file {} and data file {}",
            index_path.display(),
            data_path.display()
        );

        Ok(Store {
            state: Mutex::new(State {
                blocks,
                free,
                journal,
            }),
            data,
            read_only: config.read_only,
            remove_after_crash: config.remove_after_crash,
            index_path,
            data_path,
        })
    }

    /// Lock the data file, falling back to numbered alternates
    ///
    /// Returns the handle, the (possibly rewritten) file pair, and whether
    /// the data file was freshly created. Creating a data file removes the
    /// paired index file, which can no longer describe anything.
    fn open_data_file(config: &StoreConfig) -> Result<(SharedFile, PathBuf, PathBuf, bool)> {
        let mode = if config.read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };

        if let Some(file) = filelock::open_existing(&config.data_path, !config.read_only, mode) {
            return Ok((
                SharedFile::new(file, &config.data_path),
                config.index_path.clone(),
                config.data_path.clone(),
                false,
            ));
        }

        if config.read_only {
            warn!(
                "can't find {} to open read-only store",
                config.data_path.display()
            );
            return Err(Error::cannot_open_read_only(
                config.data_path.display().to_string(),
            ));
        }

        if let Some(file) = filelock::create_locked(&config.data_path) {
            let _ = fs::remove_file(&config.index_path);
            return Ok((
                SharedFile::new(file, &config.data_path),
                config.index_path.clone(),
                config.data_path.clone(),
                true,
            ));
        }

        warn!(
            "can't open data file {}, attempting to use an alternate",
            config.data_path.display()
        );
        for n in 0..ALTERNATE_LIMIT {
            let alt_index = numbered(&config.index_path, n);
            let alt_data = numbered(&config.data_path, n);

            if let Some(file) = filelock::open_existing(&alt_data, true, LockMode::Exclusive) {
                return Ok((SharedFile::new(file, &alt_data), alt_index, alt_data, false));
            }
            if let Some(file) = filelock::create_locked(&alt_data) {
                let _ = fs::remove_file(&alt_index);
                return Ok((SharedFile::new(file, &alt_data), alt_index, alt_data, true));
            }
        }

        warn!("couldn't open a data file after trying every alternate");
        Err(Error::cannot_create(config.data_path.display().to_string()))
    }

    /// Discard an inconsistent store: both files are deleted
    fn discard_corrupt(
        data: SharedFile,
        journal: Option<IndexJournal>,
        index_path: &Path,
        data_path: &Path,
        why: String,
    ) -> Error {
        drop(journal);
        drop(data);
        let _ = fs::remove_file(index_path);
        let _ = fs::remove_file(data_path);
        warn!("store has bad data, removed: {}", why);
        Error::corrupt(why)
    }

    /// Read the index and rebuild the blob table, free list and hole list
    #[allow(clippy::type_complexity)]
    fn load_index(
        data: SharedFile,
        data_size: u32,
        index_path: &Path,
        data_path: &Path,
        read_only: bool,
    ) -> Result<(
        SharedFile,
        BTreeMap<BlobKey, FileBlock>,
        FreeList,
        IndexJournal,
    )> {
        let mode = if read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };

        let index_len = fs::metadata(index_path).map(|meta| meta.len()).unwrap_or(0);
        let index_file = if index_len >= RECORD_SIZE as u64 {
            filelock::open_existing(index_path, !read_only, mode)
        } else {
            None
        };

        let Some(index_file) = index_file else {
            // No usable index: this is a blank store.
            if read_only {
                warn!(
                    "can't find {} to open read-only store",
                    index_path.display()
                );
                return Err(Error::cannot_open_read_only(
                    index_path.display().to_string(),
                ));
            }
            let Some(created) = filelock::create_locked(index_path) else {
                warn!("couldn't create an index file for the store, probably a sharing violation");
                drop(data);
                let _ = fs::remove_file(data_path);
                return Err(Error::cannot_create(index_path.display().to_string()));
            };
            let journal = IndexJournal::new(SharedFile::new(created, index_path), 0);
            let mut free = FreeList::new();
            let span = if data_size > 0 {
                data_size
            } else {
                DEFAULT_FRESH_SIZE
            };
            free.insert(0, span as i32);
            return Ok((data, BTreeMap::new(), free, journal));
        };

        // Whole-file read; a partial trailing record is ignored and will be
        // overwritten by the next append.
        let shared = SharedFile::new(index_file, index_path);
        let record_count = index_len / RECORD_SIZE as u64;
        let mut raw = vec![0u8; (record_count as usize) * RECORD_SIZE];
        shared.read_at(0, &mut raw)?;
        let mut journal = IndexJournal::new(shared, record_count * RECORD_SIZE as u64);

        let mut accepted: Vec<FileBlock> = Vec::new();
        for (slot, chunk) in raw.chunks_exact(RECORD_SIZE).enumerate() {
            let offset = (slot * RECORD_SIZE) as u64;
            let record = DiskRecord::decode(chunk);
            let kind = record.kind();

            let sane = record.length > 0
                && record.length as u32 <= data_size
                && record.location < data_size
                && record.size > 0
                && record.size <= record.length
                && kind.is_some();

            if sane {
                accepted.push(record.into_block(kind.unwrap(), offset));
            } else if record.length != 0 && record.size > 0 {
                // corrupt, not empty
                warn!(
                    "index corruption: {} ({}) at offset {}: location {} length {} size {}",
                    record.id, record.kind_tag, offset, record.location, record.length, record.size
                );
                return Err(Self::discard_corrupt(
                    data,
                    Some(journal),
                    index_path,
                    data_path,
                    format!("unreadable record at index offset {offset}"),
                ));
            } else {
                // a tombstone or an unwritten slot, reusable
                journal.record_hole(offset);
            }
        }

        // Walk the accepted blocks in location order: the gaps between them
        // are the free regions, and identical (location, length) runs are
        // duplicate entries that must all go.
        accepted.sort_by_key(|block| (block.location, block.length));

        let mut free = FreeList::new();
        let mut dropped = vec![false; accepted.len()];
        let mut dup_run = false;

        if let Some(first) = accepted.first() {
            if first.location > 0 {
                free.insert(0, first.location as i32);
            }
        } else if data_size > 0 {
            free.insert(0, data_size as i32);
        }

        for slot in 1..accepted.len() {
            let prev = &accepted[slot - 1];
            let cur = &accepted[slot];

            if cur.location == prev.location && cur.length == prev.length {
                warn!(
                    "removing duplicate entry at {} length {} id {}",
                    cur.location, cur.length, cur.key
                );
                if !dup_run {
                    free.insert(cur.location, cur.length);
                    dropped[slot - 1] = true;
                }
                dropped[slot] = true;
                dup_run = true;
                continue;
            }
            dup_run = false;

            let prev_end = prev.location + prev.length as u32;
            if cur.location < prev_end || prev_end > data_size {
                warn!(
                    "overlapping entries at {} length {} id {}",
                    cur.location, cur.length, cur.key
                );
                return Err(Self::discard_corrupt(
                    data,
                    Some(journal),
                    index_path,
                    data_path,
                    format!("overlapping blocks at location {}", cur.location),
                ));
            }
            if cur.location > prev_end {
                free.insert(prev_end, (cur.location - prev_end) as i32);
            }
        }

        if let Some(last) = accepted.last() {
            let end = last.location + last.length as u32;
            if end > data_size {
                return Err(Self::discard_corrupt(
                    data,
                    Some(journal),
                    index_path,
                    data_path,
                    format!("block at {} runs past the data file", last.location),
                ));
            }
            if end < data_size {
                free.insert(end, (data_size - end) as i32);
            }
        }

        let mut blocks = BTreeMap::new();
        for (slot, block) in accepted.into_iter().enumerate() {
            if dropped[slot] {
                journal.tombstone(block.index_location.expect("accepted blocks are persisted"));
            } else {
                // first record wins on a key collision; audit surfaces the rest
                blocks.entry(block.key).or_insert(block);
            }
        }

        Ok((data, blocks, free, journal))
    }

    /// Path of the index file actually in use (may be a numbered alternate)
    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Path of the data file actually in use (may be a numbered alternate)
    #[must_use]
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Whether the store was opened read-only
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn assert_writable(&self) {
        assert!(!self.read_only, "attempt to write to a read-only store");
    }

    /// Whether a blob with stored bytes exists under `key`
    ///
    /// Touches the access time on any hit, dummy included.
    pub fn exists(&self, key: BlobKey) -> bool {
        let mut state = self.state.lock();
        match state.blocks.get_mut(&key) {
            Some(block) => {
                block.touch();
                block.length > 0
            }
            None => false,
        }
    }

    /// Payload byte count of `key`, 0 when absent
    pub fn size(&self, key: BlobKey) -> u32 {
        let mut state = self.state.lock();
        match state.blocks.get_mut(&key) {
            Some(block) => {
                block.touch();
                block.size.max(0) as u32
            }
            None => 0,
        }
    }

    /// Allocated region length of `key`, 0 when absent or without a region
    pub fn max_size(&self, key: BlobKey) -> u32 {
        let mut state = self.state.lock();
        match state.blocks.get_mut(&key) {
            Some(block) => {
                block.touch();
                if block.length > 0 {
                    block.length as u32
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// Reserve `max_size` bytes (rounded up to 1 KiB) for `key`
    ///
    /// Creates the blob if needed. Growth extends in place when a free
    /// region sits directly after the block, otherwise the payload moves to
    /// a fresh region. Shrinking clamps the payload size. May evict
    /// least-recently-used blobs to make room; returns `false` when even
    /// eviction cannot produce the space.
    pub fn set_max_size(&self, key: BlobKey, max_size: u32) -> bool {
        self.assert_writable();
        if max_size == 0 || max_size > i32::MAX as u32 - BLOCK_MASK {
            warn!("refusing to assign size {} to blob {}", max_size, key);
            return false;
        }
        let max_size = round_to_block(max_size) as i32;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let live = state.blocks.get(&key).is_some_and(|block| block.length > 0);
        if !live {
            // absent, or a dummy to promote
            let Some((location, _)) = state.find_free_block(max_size, None) else {
                warn!("no space ({} bytes) for new blob {}", max_size, key);
                return false;
            };
            let State {
                blocks,
                free,
                journal,
            } = state;
            let block = blocks
                .entry(key)
                .or_insert_with(|| FileBlock::new(key, 0, 0));
            block.location = location;
            block.length = max_size;
            block.touch();
            free.use_space(location, max_size);
            journal.sync(block, false);
            return true;
        }

        {
            let State {
                blocks,
                free,
                journal,
            } = state;
            let block = blocks.get_mut(&key).expect("checked live above");
            block.touch();

            if max_size == block.length {
                return true;
            }

            if max_size < block.length {
                // shrinking: the tail becomes a free region
                free.insert(block.location + max_size as u32, block.length - max_size);
                block.length = max_size;
                if block.size > block.length {
                    warn!("truncating blob {} to {} bytes", key, block.length);
                    block.size = block.length;
                }
                journal.sync(block, false);
                return true;
            }

            // growing: first try the region directly after this block
            let grow = max_size - block.length;
            if let Some((free_loc, free_len)) = free.next_after(block.location) {
                if free_loc == block.location + block.length as u32 && free_len >= grow {
                    free.use_space(free_loc, grow);
                    block.length = max_size;
                    journal.sync(block, false);
                    return true;
                }
            }
        }

        // relocating grow
        let Some((new_location, _)) = state.find_free_block(max_size, Some(key)) else {
            warn!("no space ({} bytes) to resize blob {}", max_size, key);
            return false;
        };

        let (old_location, old_length, copy_len) = {
            let block = state.blocks.get(&key).expect("immune to eviction");
            (block.location, block.length, block.size)
        };

        // The old region is vacated first; nothing can claim it while the
        // mutex is held, and the bytes are still intact for the copy.
        state.free.insert(old_location, old_length);
        if copy_len > 0 {
            let mut payload = vec![0u8; copy_len as usize];
            let moved = self
                .data
                .read_at(u64::from(old_location), &mut payload)
                .and_then(|n| self.data.write_at(u64::from(new_location), &payload[..n]));
            if let Err(e) = moved {
                error!("relocating blob {} failed: {}", key, e);
            }
        }

        let State {
            blocks,
            free,
            journal,
        } = state;
        let block = blocks.get_mut(&key).expect("immune to eviction");
        block.location = new_location;
        block.length = max_size;
        free.use_space(new_location, max_size);
        journal.sync(block, false);
        true
    }

    /// Read from `key` at `offset`, filling as much of `buf` as the payload
    /// provides past that offset. Returns the bytes read; reads past the
    /// payload return 0.
    pub fn read(&self, key: BlobKey, buf: &mut [u8], offset: u32) -> usize {
        let (absolute, len) = {
            let mut state = self.state.lock();
            let Some(block) = state.blocks.get_mut(&key) else {
                return 0;
            };
            block.touch();

            let size = block.size.max(0) as u32;
            if offset > size {
                warn!(
                    "attempt to read at {} in blob {} of length {}",
                    offset, key, size
                );
                return 0;
            }
            let len = buf.len().min((size - offset) as usize);
            (u64::from(block.location) + u64::from(offset), len)
        };

        if len == 0 {
            return 0;
        }
        match self.data.read_at(absolute, &mut buf[..len]) {
            Ok(n) => n,
            Err(e) => {
                error!("data read for {} failed: {}", key, e);
                0
            }
        }
    }

    /// Write `data` into `key` at `offset`; returns the bytes written
    ///
    /// Writes clamp to the allocated region. Unknown keys and offsets past
    /// the region write nothing.
    pub fn write(&self, key: BlobKey, data: &[u8], offset: u32) -> usize {
        self.write_impl(key, data, Some(offset))
    }

    /// Write `data` at the current end of `key`'s payload
    pub fn append(&self, key: BlobKey, data: &[u8]) -> usize {
        self.write_impl(key, data, None)
    }

    fn write_impl(&self, key: BlobKey, data: &[u8], offset: Option<u32>) -> usize {
        self.assert_writable();

        let (absolute, offset, len) = {
            let mut state = self.state.lock();
            let Some(block) = state.blocks.get_mut(&key) else {
                return 0;
            };
            block.touch();

            if block.is_dummy() {
                warn!(
                    "attempt to write {} bytes to removed blob {}",
                    data.len(),
                    key
                );
                return 0;
            }

            let offset = offset.unwrap_or(block.size.max(0) as u32);
            let length = block.length as u32;
            if offset > length {
                warn!(
                    "attempt to write at {} in blob {} of region length {}",
                    offset, key, length
                );
                return 0;
            }

            let mut len = data.len();
            if len > (length - offset) as usize {
                warn!("truncating write to blob {}", key);
                len = (length - offset) as usize;
            }
            (u64::from(block.location) + u64::from(offset), offset, len)
        };

        if len == 0 {
            return 0;
        }
        if let Err(e) = self.data.write_at(absolute, &data[..len]) {
            error!("data write for {} failed: {}", key, e);
            return 0;
        }

        // Publish any payload growth. The blob may have been evicted or
        // resized while the mutex was released; re-find before touching it.
        let mut guard = self.state.lock();
        let State {
            blocks, journal, ..
        } = &mut *guard;
        if let Some(block) = blocks.get_mut(&key) {
            let end = (offset as usize + len) as i32;
            if block.length > 0 && end > block.size {
                block.size = end.min(block.length);
                journal.sync(block, false);
            }
        }
        len
    }

    /// Delete `key`'s stored bytes
    ///
    /// The region returns to the free list and the index record becomes a
    /// tombstone. A descriptor with outstanding lock counters survives as a
    /// dummy; otherwise the entry is gone.
    pub fn remove(&self, key: BlobKey) {
        self.assert_writable();
        let mut state = self.state.lock();
        if state.blocks.contains_key(&key) {
            state.remove_block(&key);
        } else {
            warn!("attempt to remove nonexistent blob {}", key);
        }
    }

    /// Move `old_key`'s bytes and region to `new_key`
    ///
    /// An existing destination is deleted first. The blob moves but its
    /// locks stay put: renaming onto a destination with outstanding lock
    /// counters is a fatal invariant violation.
    pub fn rename(&self, old_key: BlobKey, new_key: BlobKey) {
        self.assert_writable();
        let mut state = self.state.lock();

        if !state.blocks.contains_key(&old_key) {
            warn!("attempt to rename nonexistent blob {}", old_key);
            return;
        }

        if state.blocks.contains_key(&new_key) {
            // purge the destination's data; a dummy remains if it was locked
            state.remove_block(&new_key);
            if let Some(dest) = state.blocks.remove(&new_key) {
                assert!(
                    !dest.is_locked_any(),
                    "renaming {old_key} onto locked blob {new_key}"
                );
            }
        }

        let mut block = state
            .blocks
            .remove(&old_key)
            .expect("checked presence above");
        block.key = new_key;
        block.touch();
        state.journal.sync(&mut block, false);
        state.blocks.insert(new_key, block);
    }

    /// Increment `key`'s counter for `kind`, creating a dummy if needed
    pub fn inc_lock(&self, key: BlobKey, kind: LockKind) {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .entry(key)
            .or_insert_with(|| FileBlock::dummy(key));
        block.locks[kind as usize] += 1;
    }

    /// Decrement `key`'s counter for `kind`
    pub fn dec_lock(&self, key: BlobKey, kind: LockKind) {
        let mut state = self.state.lock();
        if let Some(block) = state.blocks.get_mut(&key) {
            if block.locks[kind as usize] > 0 {
                block.locks[kind as usize] -= 1;
            } else {
                warn!("decrementing zero-value {:?} lock on {}", kind, key);
            }
        }
    }

    /// Whether `key` holds an outstanding `kind` lock
    pub fn is_locked(&self, key: BlobKey, kind: LockKind) -> bool {
        self.state
            .lock()
            .blocks
            .get(&key)
            .is_some_and(|block| block.locks[kind as usize] > 0)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // handles close with the struct, releasing the advisory locks
        if !self.read_only && self.remove_after_crash {
            let _ = fs::remove_file(marker_path(&self.data_path));
        }
    }
}

impl State {
    /// Find a free region of at least `size` bytes, evicting if needed
    ///
    /// Preference order is smallest sufficient region. When nothing fits,
    /// unlocked blobs are deleted in access-time order: the oldest alone if
    /// it is big enough, otherwise a sweep until `max(size, CLEANUP_TARGET)`
    /// bytes come back. The `immune` blob is never a candidate. Returns
    /// `None` once the candidates run out.
    pub(crate) fn find_free_block(
        &mut self,
        size: i32,
        immune: Option<BlobKey>,
    ) -> Option<(u32, i32)> {
        let mut candidates: Option<BTreeSet<(u32, BlobKey)>> = None;

        loop {
            if let Some(found) = self.free.find(size) {
                return Some(found);
            }

            let lru = candidates.get_or_insert_with(|| {
                self.blocks
                    .iter()
                    .filter(|(key, block)| {
                        Some(**key) != immune && block.length > 0 && !block.is_locked_any()
                    })
                    .map(|(key, block)| (block.access_time, *key))
                    .collect()
            });

            if lru.is_empty() {
                warn!("can't make {} bytes of free space, giving up", size);
                return None;
            }

            // about half the time the oldest blob alone is big enough
            let &(access_time, key) = lru.iter().next().expect("checked non-empty");
            let length = self.blocks.get(&key).map_or(0, |block| block.length);
            if length >= size {
                info!("evicting {} to reclaim {} bytes", key, length);
                lru.remove(&(access_time, key));
                self.remove_block(&key);
                continue;
            }

            // sweep the oldest blobs; over-shooting the request batches up
            // free space so small allocations don't evict one blob at a time
            let target = i64::from(size.max(CLEANUP_TARGET));
            info!(
                "eviction sweep targeting {} bytes, {} candidates",
                target,
                lru.len()
            );
            let mut reclaimed = 0i64;
            let mut victims = Vec::new();
            for &(access_time, key) in lru.iter() {
                if reclaimed >= target {
                    break;
                }
                reclaimed += i64::from(self.blocks.get(&key).map_or(0, |block| block.length));
                victims.push((access_time, key));
            }
            for (access_time, key) in victims {
                lru.remove(&(access_time, key));
                self.remove_block(&key);
            }
        }
    }

    /// Delete a blob's stored bytes, keeping a dummy only for its locks
    pub(crate) fn remove_block(&mut self, key: &BlobKey) {
        let Some(mut block) = self.blocks.remove(key) else {
            return;
        };

        self.journal.sync(&mut block, true);

        if block.length > 0 {
            self.free.insert(block.location, block.length);
        }

        if block.is_locked_any() {
            block.location = 0;
            block.size = 0;
            block.length = INVALID_LENGTH;
            block.index_location = None;
            self.blocks.insert(*key, block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};
    use vcache_common::{AssetId, AssetKind};

    const KIB: u32 = 1024;

    fn key(tag: u8) -> BlobKey {
        BlobKey::new(AssetId::from_bytes([tag; 16]), AssetKind::Texture)
    }

    fn config_in(dir: &TempDir) -> StoreConfig {
        StoreConfig::new(dir.path().join("cache.idx"), dir.path().join("cache.dat")).presize(64 * KIB)
    }

    fn fresh_store(dir: &TempDir) -> Store {
        Store::open(config_in(dir)).unwrap()
    }

    fn set_access_time(store: &Store, key: BlobKey, access_time: u32) {
        let mut state = store.state.lock();
        state.blocks.get_mut(&key).unwrap().access_time = access_time;
    }

    fn free_regions(store: &Store) -> Vec<(u32, i32)> {
        store.state.lock().free.iter().collect()
    }

    #[test]
    fn test_single_blob_roundtrip() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 2048));
        assert_eq!(store.write(key(1), b"hello", 0), 5);
        assert_eq!(store.size(key(1)), 5);
        assert_eq!(store.max_size(key(1)), 2048);

        let mut buf = [0u8; 5];
        assert_eq!(store.read(key(1), &mut buf, 0), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_free_list_coalescing_on_delete() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        // three contiguous blobs at 0, 4K and 8K
        for tag in 1..=3 {
            assert!(store.set_max_size(key(tag), 4 * KIB));
        }
        assert_eq!(free_regions(&store), vec![(12 * KIB, 52 * 1024)]);

        store.remove(key(2));
        assert_eq!(
            free_regions(&store),
            vec![(4 * KIB, 4 * 1024), (12 * KIB, 52 * 1024)]
        );

        store.remove(key(1));
        assert_eq!(
            free_regions(&store),
            vec![(0, 8 * 1024), (12 * KIB, 52 * 1024)]
        );

        store.remove(key(3));
        assert_eq!(free_regions(&store), vec![(0, 64 * 1024)]);
    }

    #[test]
    fn test_grow_in_place() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 2048));
        assert_eq!(store.write(key(1), b"hello", 0), 5);

        assert!(store.set_max_size(key(1), 4096));
        assert_eq!(store.max_size(key(1)), 4096);

        // a relocation would have left a hole at the front
        assert_eq!(free_regions(&store), vec![(4096, 64 * 1024 - 4096)]);

        let mut buf = [0u8; 5];
        store.read(key(1), &mut buf, 0);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_grow_relocates_past_neighbour() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 4 * KIB));
        assert!(store.set_max_size(key(2), KIB));
        store.write(key(1), b"front", 0);

        assert!(store.set_max_size(key(1), 8 * KIB));

        // the vacated front region is free, the blob now lives past key 2
        assert_eq!(
            free_regions(&store),
            vec![(0, 4 * 1024), (13 * KIB, (64 - 13) as i32 * 1024)]
        );

        let mut buf = [0u8; 5];
        store.read(key(1), &mut buf, 0);
        assert_eq!(&buf, b"front");
        assert_eq!(store.size(key(2)), 0);
    }

    #[test]
    fn test_lru_evicts_oldest_first() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir).presize(16 * KIB);
        let store = Store::open(config).unwrap();

        for tag in 1..=4 {
            assert!(store.set_max_size(key(tag), 4 * KIB));
            set_access_time(&store, key(tag), 100 * u32::from(tag));
        }

        // full store: the oldest blob alone covers this request
        assert!(store.set_max_size(key(5), 4 * KIB));
        assert!(!store.exists(key(1)));
        assert!(store.exists(key(2)));
        assert!(store.exists(key(3)));
        assert!(store.exists(key(4)));
        assert!(store.exists(key(5)));
    }

    #[test]
    fn test_lru_skips_locked_blobs() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir).presize(16 * KIB);
        let store = Store::open(config).unwrap();

        for tag in 1..=4 {
            assert!(store.set_max_size(key(tag), 4 * KIB));
            set_access_time(&store, key(tag), 100 * u32::from(tag));
        }
        store.inc_lock(key(1), LockKind::Read);

        assert!(store.set_max_size(key(5), 4 * KIB));
        assert!(store.exists(key(1)));
        assert!(!store.exists(key(2)));
    }

    #[test]
    fn test_eviction_sweep_batches_free_space() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir).presize(16 * KIB);
        let store = Store::open(config).unwrap();

        for tag in 1..=4 {
            assert!(store.set_max_size(key(tag), 4 * KIB));
            set_access_time(&store, key(tag), 100 * u32::from(tag));
        }

        // no single blob covers 8K; the sweep reclaims until it fits
        assert!(store.set_max_size(key(5), 8 * KIB));
        assert!(store.exists(key(5)));
        for tag in 1..=4 {
            assert!(!store.exists(key(tag)));
        }
    }

    #[test]
    fn test_eviction_gives_up_when_all_locked() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir).presize(8 * KIB);
        let store = Store::open(config).unwrap();

        assert!(store.set_max_size(key(1), 4 * KIB));
        assert!(store.set_max_size(key(2), 4 * KIB));
        store.inc_lock(key(1), LockKind::Open);
        store.inc_lock(key(2), LockKind::Append);

        assert!(!store.set_max_size(key(3), 4 * KIB));
        assert!(store.exists(key(1)));
        assert!(store.exists(key(2)));
    }

    #[test]
    fn test_crash_marker_recovery() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir).remove_after_crash(true);
        let marker = marker_path(&config.data_path);

        {
            let store = Store::open(config.clone()).unwrap();
            assert!(marker.exists());
            assert!(store.set_max_size(key(1), 2048));
            store.write(key(1), b"doomed", 0);
            assert!(store.set_max_size(key(2), 2048));
            store.write(key(2), b"also doomed", 0);
        }
        // clean close removed the marker
        assert!(!marker.exists());

        // fake an unclean shutdown
        fs::File::create(&marker).unwrap();
        {
            let store = Store::open(config.clone()).unwrap();
            assert!(!store.exists(key(1)));
            assert!(!store.exists(key(2)));
            let mut buf = [0u8; 16];
            assert_eq!(store.read(key(1), &mut buf, 0), 0);
            assert!(marker.exists());
        }
        assert!(!marker.exists());
    }

    #[test]
    fn test_clean_close_persists_blobs() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir);

        {
            let store = Store::open(config.clone()).unwrap();
            assert!(store.set_max_size(key(1), 2048));
            assert_eq!(store.write(key(1), b"durable", 0), 7);
        }

        let store = Store::open(config).unwrap();
        assert!(store.exists(key(1)));
        assert_eq!(store.size(key(1)), 7);
        let mut buf = [0u8; 7];
        assert_eq!(store.read(key(1), &mut buf, 0), 7);
        assert_eq!(&buf, b"durable");

        // the free list was rebuilt from the gaps
        assert_eq!(free_regions(&store), vec![(2048, 64 * 1024 - 2048)]);
    }

    #[test]
    fn test_reopen_read_only() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir);
        {
            let store = Store::open(config.clone()).unwrap();
            store.set_max_size(key(1), 1024);
            store.write(key(1), b"shared", 0);
        }

        let store = Store::open(config.read_only(true)).unwrap();
        assert!(store.is_read_only());
        let mut buf = [0u8; 6];
        assert_eq!(store.read(key(1), &mut buf, 0), 6);
        assert_eq!(&buf, b"shared");
    }

    #[test]
    fn test_read_only_without_store_fails() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir).read_only(true);
        assert!(matches!(
            Store::open(config),
            Err(Error::CannotOpenReadOnly(_))
        ));
    }

    #[test]
    #[should_panic(expected = "read-only store")]
    fn test_write_to_read_only_panics() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(config_in(&dir)).unwrap();
            assert!(store.set_max_size(key(1), 1024));
            store.write(key(1), b"seed", 0);
        }

        let store = Store::open(config_in(&dir).read_only(true)).unwrap();
        store.set_max_size(key(1), 1024);
    }

    #[cfg(unix)]
    #[test]
    fn test_second_writer_takes_alternate() {
        let dir = tempdir().unwrap();
        let first = fresh_store(&dir);

        let second = Store::open(config_in(&dir)).unwrap();
        assert_ne!(second.data_path(), first.data_path());
        assert!(second.data_path().to_string_lossy().ends_with(".0"));

        assert!(second.set_max_size(key(1), 1024));
        assert_eq!(second.write(key(1), b"alt", 0), 3);
    }

    #[test]
    fn test_set_max_size_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 3000));
        let after_first = free_regions(&store);
        assert!(store.set_max_size(key(1), 3000));
        assert_eq!(free_regions(&store), after_first);
        assert_eq!(store.max_size(key(1)), 3072);
    }

    #[test]
    fn test_shrink_clamps_payload_and_coalesces() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 4 * KIB));
        let payload = vec![0xA5u8; 4096];
        assert_eq!(store.write(key(1), &payload, 0), 4096);

        assert!(store.set_max_size(key(1), 3 * KIB));
        assert_eq!(store.size(key(1)), 3 * KIB);
        assert_eq!(store.max_size(key(1)), 3 * KIB);

        // the freed tail must merge with the trailing region
        assert_eq!(free_regions(&store), vec![(3 * KIB, 64 * 1024 - 3 * 1024)]);
    }

    #[test]
    fn test_remove_forgets_blob() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 1024));
        store.write(key(1), b"bytes", 0);
        store.remove(key(1));

        assert!(!store.exists(key(1)));
        assert_eq!(store.size(key(1)), 0);
        assert_eq!(store.max_size(key(1)), 0);

        // unknown removes warn but do not fail
        store.remove(key(9));
    }

    #[test]
    fn test_rename_moves_data_and_key() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 1024));
        store.write(key(1), b"moving", 0);

        store.rename(key(1), key(2));
        assert!(!store.exists(key(1)));
        assert!(store.exists(key(2)));

        let mut buf = [0u8; 6];
        assert_eq!(store.read(key(2), &mut buf, 0), 6);
        assert_eq!(&buf, b"moving");
    }

    #[test]
    fn test_rename_replaces_destination() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 1024));
        store.write(key(1), b"winner", 0);
        assert!(store.set_max_size(key(2), 2048));
        store.write(key(2), b"loser", 0);

        store.rename(key(1), key(2));
        assert_eq!(store.size(key(2)), 6);
        let mut buf = [0u8; 6];
        store.read(key(2), &mut buf, 0);
        assert_eq!(&buf, b"winner");
    }

    #[test]
    #[should_panic(expected = "locked blob")]
    fn test_rename_onto_locked_destination_panics() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 1024));
        assert!(store.set_max_size(key(2), 1024));
        store.inc_lock(key(2), LockKind::Open);

        store.rename(key(1), key(2));
    }

    #[test]
    fn test_lock_counters_pair_up() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 1024));
        assert!(!store.is_locked(key(1), LockKind::Read));

        store.inc_lock(key(1), LockKind::Read);
        store.inc_lock(key(1), LockKind::Read);
        assert!(store.is_locked(key(1), LockKind::Read));
        assert!(!store.is_locked(key(1), LockKind::Append));

        store.dec_lock(key(1), LockKind::Read);
        assert!(store.is_locked(key(1), LockKind::Read));
        store.dec_lock(key(1), LockKind::Read);
        assert!(!store.is_locked(key(1), LockKind::Read));

        // decrementing past zero warns but must not underflow
        store.dec_lock(key(1), LockKind::Read);
        assert!(!store.is_locked(key(1), LockKind::Read));
    }

    #[test]
    fn test_lock_on_absent_key_creates_dummy() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        store.inc_lock(key(1), LockKind::Open);
        assert!(store.is_locked(key(1), LockKind::Open));
        assert!(!store.exists(key(1)));
        assert_eq!(store.max_size(key(1)), 0);
    }

    #[test]
    fn test_remove_preserves_locks_via_dummy() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 1024));
        store.inc_lock(key(1), LockKind::Open);
        store.remove(key(1));

        assert!(!store.exists(key(1)));
        assert!(store.is_locked(key(1), LockKind::Open));

        // promoting the dummy keeps the counter
        assert!(store.set_max_size(key(1), 1024));
        assert!(store.exists(key(1)));
        assert!(store.is_locked(key(1), LockKind::Open));
    }

    #[test]
    fn test_append_after_reserve() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 2048));
        assert_eq!(store.append(key(1), b"abc"), 3);
        assert_eq!(store.append(key(1), b"def"), 3);
        assert_eq!(store.size(key(1)), 6);

        let mut buf = [0u8; 6];
        assert_eq!(store.read(key(1), &mut buf, 0), 6);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn test_write_clamps_to_region() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 1024));
        let big = vec![0x42u8; 2000];
        assert_eq!(store.write(key(1), &big, 0), 1024);
        assert_eq!(store.size(key(1)), 1024);

        // offset past the region writes nothing
        assert_eq!(store.write(key(1), b"x", 5000), 0);

        // unknown key writes nothing
        assert_eq!(store.write(key(9), b"x", 0), 0);
    }

    #[test]
    fn test_read_clamps_to_payload() {
        let dir = tempdir().unwrap();
        let store = fresh_store(&dir);

        assert!(store.set_max_size(key(1), 1024));
        store.write(key(1), b"hello", 0);

        let mut buf = [0u8; 10];
        assert_eq!(store.read(key(1), &mut buf, 3), 2);
        assert_eq!(&buf[..2], b"lo");

        // offset past the payload reads nothing
        assert_eq!(store.read(key(1), &mut buf, 6), 0);
        assert_eq!(store.read(key(9), &mut buf, 0), 0);
    }

    #[test]
    fn test_tombstone_slots_reused_across_reopen() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir);

        {
            let store = Store::open(config.clone()).unwrap();
            for tag in 1..=3 {
                assert!(store.set_max_size(key(tag), 1024));
                store.write(key(tag), &[tag], 0);
            }
            store.remove(key(2));
        }

        let index_len = fs::metadata(&config.index_path).unwrap().len();
        assert_eq!(index_len, 3 * RECORD_SIZE as u64);

        let store = Store::open(config.clone()).unwrap();
        assert!(store.set_max_size(key(4), 1024));
        store.write(key(4), &[4], 0);
        drop(store);

        // the new blob filled the tombstoned slot instead of growing the file
        assert_eq!(
            fs::metadata(&config.index_path).unwrap().len(),
            3 * RECORD_SIZE as u64
        );
    }

    #[test]
    fn test_corrupt_index_discards_store() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir);
        {
            let store = Store::open(config.clone()).unwrap();
            assert!(store.set_max_size(key(1), 1024));
            store.write(key(1), b"x", 0);
        }

        // hand-craft a record pointing far outside the data file
        let mut block = FileBlock::new(key(7), 0x00FF_0000, 1024);
        block.size = 64;
        let mut raw = fs::read(&config.index_path).unwrap();
        raw.extend_from_slice(&block.encode());
        fs::write(&config.index_path, &raw).unwrap();

        assert!(matches!(
            Store::open(config.clone()),
            Err(Error::Corrupt(_))
        ));
        assert!(!config.index_path.exists());
        assert!(!config.data_path.exists());

        // a fresh open starts over cleanly
        let store = Store::open(config).unwrap();
        assert!(!store.exists(key(1)));
    }

    #[test]
    fn test_duplicate_records_both_dropped() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir);
        {
            let store = Store::open(config.clone()).unwrap();
            assert!(store.set_max_size(key(1), 4 * KIB));
            store.write(key(1), b"twin", 0);
        }

        // duplicate the record under a different key
        let mut raw = fs::read(&config.index_path).unwrap();
        let mut twin = DiskRecord::decode(&raw[..RECORD_SIZE])
            .into_block(AssetKind::Texture, 0);
        twin.key = key(2);
        raw.extend_from_slice(&twin.encode());
        fs::write(&config.index_path, &raw).unwrap();

        let store = Store::open(config).unwrap();
        assert!(!store.exists(key(1)));
        assert!(!store.exists(key(2)));
        assert_eq!(free_regions(&store), vec![(0, 64 * 1024)]);
    }

    #[test]
    fn test_unwritten_reservation_does_not_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = config_in(&dir);
        {
            let store = Store::open(config.clone()).unwrap();
            assert!(store.set_max_size(key(1), 2048));
            // never written: the record carries size 0
        }

        let store = Store::open(config).unwrap();
        assert!(!store.exists(key(1)));
        assert_eq!(free_regions(&store), vec![(0, 64 * 1024)]);
    }
}
