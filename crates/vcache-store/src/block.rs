//! Block descriptors and the on-disk index record
//!
//! The index file is a packed array of fixed 34-byte little-endian records,
//! one per stored blob:
//!
//! ```text
//! +--------+--------+-------------+----------+------+--------+
//! | loc u32| len i32| access  u32 | uuid[16] | kind | size   |
//! |  0..4  |  4..8  |    8..12    |  12..28  | i16  |  i32   |
//! +--------+--------+-------------+----------+------+--------+
//! ```
//!
//! The layout is little-endian regardless of host; all access goes through
//! the encode/decode helpers below. A record of 34 zero bytes is a
//! tombstone. A descriptor whose length is the invalid sentinel is a
//! "dummy": it owns no region, is never persisted, and exists only to hold
//! outstanding lock counters for its key.

use bytes::{Buf, BufMut};
use std::time::{SystemTime, UNIX_EPOCH};
use vcache_common::{AssetId, AssetKind, BlobKey};

/// Serialized size of one index record
pub const RECORD_SIZE: usize = 34;

/// Allocation granularity: every region length is a multiple of this
pub const BLOCK_GRANULARITY: u32 = 1024;

/// Low-bit mask matching [`BLOCK_GRANULARITY`]
pub const BLOCK_MASK: u32 = BLOCK_GRANULARITY - 1;

/// Length sentinel marking a dummy descriptor
pub const INVALID_LENGTH: i32 = -1;

/// Minimum bytes reclaimed by one aggressive eviction sweep (5 MiB)
pub const CLEANUP_TARGET: i32 = 5 * 1024 * 1024;

/// Data area assumed for a fresh store whose data file is empty (1 GiB)
pub const DEFAULT_FRESH_SIZE: u32 = 0x4000_0000;

/// How many numbered alternate file pairs to try when the primary is locked
pub const ALTERNATE_LIMIT: u32 = 256;

/// Round a byte count up to the allocation granularity
#[inline]
#[must_use]
pub const fn round_to_block(bytes: u32) -> u32 {
    (bytes + BLOCK_MASK) & !BLOCK_MASK
}

/// Seconds since the Unix epoch, truncated to the record's 32-bit field
#[must_use]
pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Kinds of advisory blob locks
///
/// Each kind has its own counter on the descriptor; the evictor skips any
/// blob with a nonzero counter of any kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum LockKind {
    Read = 0,
    Append = 1,
    Open = 2,
}

impl LockKind {
    /// Number of lock kinds
    pub const COUNT: usize = 3;
}

/// In-memory descriptor for one stored blob
#[derive(Clone, Debug)]
pub struct FileBlock {
    /// Identity of the blob
    pub key: BlobKey,
    /// Start of the allocated region in the data file
    pub location: u32,
    /// Allocated region length, or [`INVALID_LENGTH`] for a dummy
    pub length: i32,
    /// Actual payload bytes, `0 <= size <= length`
    pub size: i32,
    /// Seconds since epoch of the last access
    pub access_time: u32,
    /// Byte offset of this block's record in the index file
    pub index_location: Option<u64>,
    /// Outstanding lock counters, one per [`LockKind`]
    pub locks: [u32; LockKind::COUNT],
}

impl FileBlock {
    /// Create a descriptor for a freshly allocated region
    #[must_use]
    pub fn new(key: BlobKey, location: u32, length: i32) -> Self {
        Self {
            key,
            location,
            length,
            size: 0,
            access_time: unix_now(),
            index_location: None,
            locks: [0; LockKind::COUNT],
        }
    }

    /// Create a dummy descriptor holding only lock counters
    #[must_use]
    pub fn dummy(key: BlobKey) -> Self {
        Self::new(key, 0, INVALID_LENGTH)
    }

    /// Whether this descriptor owns no region
    #[must_use]
    pub fn is_dummy(&self) -> bool {
        self.length == INVALID_LENGTH
    }

    /// Whether any lock counter is outstanding
    #[must_use]
    pub fn is_locked_any(&self) -> bool {
        self.locks.iter().any(|&count| count > 0)
    }

    /// Update the access time to now
    pub fn touch(&mut self) {
        self.access_time = unix_now();
    }

    /// Serialize into a 34-byte index record
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        let mut cursor = &mut buf[..];

        cursor.put_u32_le(self.location);
        cursor.put_i32_le(self.length);
        cursor.put_u32_le(self.access_time);
        cursor.put_slice(self.key.id.as_bytes());
        cursor.put_i16_le(self.key.kind.as_i16());
        cursor.put_i32_le(self.size);

        buf
    }
}

/// A raw, not yet validated index record
///
/// Decoding never fails: the open path needs the raw fields of invalid
/// records to tell an index hole from corruption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskRecord {
    pub location: u32,
    pub length: i32,
    pub access_time: u32,
    pub id: AssetId,
    pub kind_tag: i16,
    pub size: i32,
}

impl DiskRecord {
    /// Parse a 34-byte record
    ///
    /// # Panics
    /// Panics if `data` is shorter than [`RECORD_SIZE`].
    #[must_use]
    pub fn decode(data: &[u8]) -> Self {
        assert!(data.len() >= RECORD_SIZE, "short index record");
        let mut buf = data;

        let location = buf.get_u32_le();
        let length = buf.get_i32_le();
        let access_time = buf.get_u32_le();
        let mut id_bytes = [0u8; 16];
        buf.copy_to_slice(&mut id_bytes);
        let kind_tag = buf.get_i16_le();
        let size = buf.get_i32_le();

        Self {
            location,
            length,
            access_time,
            id: AssetId::from_bytes(id_bytes),
            kind_tag,
            size,
        }
    }

    /// The asset kind, if the tag is in range
    #[must_use]
    pub fn kind(&self) -> Option<AssetKind> {
        AssetKind::try_from(self.kind_tag).ok()
    }

    /// Reconstruct the descriptor for a record accepted at open
    #[must_use]
    pub fn into_block(self, kind: AssetKind, index_location: u64) -> FileBlock {
        FileBlock {
            key: BlobKey::new(self.id, kind),
            location: self.location,
            length: self.length,
            size: self.size,
            access_time: self.access_time,
            index_location: Some(index_location),
            locks: [0; LockKind::COUNT],
        }
    }
}
