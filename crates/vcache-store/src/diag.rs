//! Diagnostics: audit, statistics and raw dump
//!
//! All three are observational. Audit cross-checks the index file against
//! the in-memory tables and reports divergence without repairing anything;
//! statistics summarise occupancy and fragmentation; dump bulk-exports blob
//! payloads for offline inspection.

use crate::block::{DiskRecord, RECORD_SIZE, unix_now};
use crate::store::Store;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use vcache_common::{AssetKind, BlobKey, Result};

/// Outcome of one audit pass
#[derive(Clone, Debug, Default)]
pub struct AuditReport {
    /// Valid records on disk with no in-memory block
    pub disk_orphans: Vec<BlobKey>,
    /// In-memory blobs with payload that are missing on disk
    pub memory_orphans: Vec<BlobKey>,
    /// Records whose fields differ from the in-memory descriptor
    pub mismatched: Vec<BlobKey>,
    /// Keys appearing in more than one record
    pub duplicate_keys: Vec<BlobKey>,
    /// Non-empty records that fail the sanity checks
    pub corrupt_records: usize,
    /// Live blobs whose index offset sits on the hole list
    pub hole_conflicts: Vec<BlobKey>,
}

impl AuditReport {
    /// Whether disk and memory agree completely
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.disk_orphans.is_empty()
            && self.memory_orphans.is_empty()
            && self.mismatched.is_empty()
            && self.duplicate_keys.is_empty()
            && self.corrupt_records == 0
            && self.hole_conflicts.is_empty()
    }
}

/// Per-kind occupancy
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct KindStats {
    pub count: usize,
    pub bytes: u64,
}

/// Occupancy and fragmentation summary
#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    /// Blobs holding a region
    pub blob_count: usize,
    /// Descriptors kept only for their lock counters
    pub dummy_count: usize,
    /// Free regions
    pub free_count: usize,
    /// Reusable index record slots
    pub index_holes: usize,
    /// Sum of allocated region lengths
    pub total_blob_bytes: u64,
    /// Sum of free region lengths
    pub total_free_bytes: u64,
    /// Largest allocated region
    pub largest_blob: u32,
    /// Largest free region
    pub largest_free: u32,
    /// Free region length -> occurrence count
    pub free_size_histogram: BTreeMap<u32, usize>,
    /// Occupancy per asset kind
    pub kind_totals: BTreeMap<AssetKind, KindStats>,
    /// Adjacent free regions; any nonzero count is an invariant violation
    pub adjacent_free_pairs: usize,
}

impl StoreStats {
    /// Fraction of tracked space holding blobs, in `0.0..=1.0`
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let tracked = self.total_blob_bytes + self.total_free_bytes;
        if tracked == 0 {
            return 0.0;
        }
        self.total_blob_bytes as f64 / tracked as f64
    }
}

impl Store {
    /// Re-read the index from disk and cross-check it against memory
    ///
    /// Holds the metadata mutex for the whole pass. Purely observational:
    /// nothing is repaired, every finding is also logged.
    pub fn audit(&self) -> Result<AuditReport> {
        let state = self.state.lock();

        let mut raw = vec![0u8; state.journal.end() as usize];
        state.journal.file().read_at(0, &mut raw)?;

        let now = unix_now();
        let mut report = AuditReport::default();
        let mut seen: BTreeMap<BlobKey, u64> = BTreeMap::new();

        for (slot, chunk) in raw.chunks_exact(RECORD_SIZE).enumerate() {
            let offset = (slot * RECORD_SIZE) as u64;
            let record = DiskRecord::decode(chunk);
            let kind = record.kind();

            let sane = record.length >= 0
                && record.size >= 0
                && record.size <= record.length
                && kind.is_some()
                && record.access_time <= now
                && !record.id.is_nil();
            if !sane {
                if record.length != 0 {
                    warn!("blob record at offset {} corrupt on disk", offset);
                    report.corrupt_records += 1;
                }
                // else just a hole
                continue;
            }

            let blob = BlobKey::new(record.id, kind.expect("checked above"));
            if seen.contains_key(&blob) {
                warn!("duplicate record for {} at offset {}", blob, offset);
                report.duplicate_keys.push(blob);
                continue;
            }
            seen.insert(blob, offset);

            match state.blocks.get(&blob) {
                None => {
                    warn!("blob {} on disk, not in memory, offset {}", blob, offset);
                    report.disk_orphans.push(blob);
                }
                Some(block) => {
                    // access times drift: touches update memory without a
                    // record write, so they are not compared here
                    let agrees = block.index_location == Some(offset)
                        && block.location == record.location
                        && block.length == record.length
                        && block.size == record.size;
                    if !agrees {
                        warn!("blob {} record at offset {} differs from memory", blob, offset);
                        report.mismatched.push(blob);
                    }
                }
            }
        }

        for (blob, block) in &state.blocks {
            if block.size > 0 && !seen.contains_key(blob) {
                warn!("blob {} in memory, not on disk", blob);
                report.memory_orphans.push(*blob);
            }
            if block.length > 0 {
                if let Some(offset) = block.index_location {
                    if state.journal.is_hole(offset) {
                        warn!("blob {} record offset {} is marked as a hole", blob, offset);
                        report.hole_conflicts.push(*blob);
                    }
                }
            }
        }

        if report.is_clean() {
            info!("store audit OK");
        }
        Ok(report)
    }

    /// Summarise occupancy and fragmentation
    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        let mut stats = StoreStats {
            index_holes: state.journal.hole_count(),
            ..StoreStats::default()
        };

        for block in state.blocks.values() {
            if block.is_dummy() {
                stats.dummy_count += 1;
                continue;
            }
            stats.blob_count += 1;
            stats.total_blob_bytes += block.length as u64;
            stats.largest_blob = stats.largest_blob.max(block.length as u32);

            let entry = stats.kind_totals.entry(block.key.kind).or_default();
            entry.count += 1;
            entry.bytes += block.length as u64;
        }

        let mut prev_end: Option<u32> = None;
        for (location, length) in state.free.iter() {
            stats.free_count += 1;
            stats.total_free_bytes += length as u64;
            stats.largest_free = stats.largest_free.max(length as u32);
            *stats.free_size_histogram.entry(length as u32).or_default() += 1;

            if prev_end == Some(location) {
                stats.adjacent_free_pairs += 1;
            }
            prev_end = Some(location + length as u32);
        }

        stats
    }

    /// Export every non-empty blob to `<dir>/<uuid>.<ext>`
    ///
    /// Returns the number of files written. Debug aid only.
    pub fn dump(&self, dir: &Path) -> Result<usize> {
        fs::create_dir_all(dir)?;

        let manifest: Vec<(BlobKey, i32)> = {
            let state = self.state.lock();
            state
                .blocks
                .values()
                .filter(|block| block.length > 0 && block.size > 0)
                .map(|block| (block.key, block.size))
                .collect()
        };

        let mut written = 0;
        for (blob, size) in manifest {
            let mut payload = vec![0u8; size as usize];
            let got = self.read(blob, &mut payload, 0);
            payload.truncate(got);

            let name = format!("{}.{}", blob.id, blob.kind.extension());
            fs::write(dir.join(&name), &payload)?;
            info!("dumped {} ({} bytes)", name, got);
            written += 1;
        }
        Ok(written)
    }
}
