//! Configuration for opening a store

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options controlling how a store is opened
///
/// A store is a pair of host files: the index file (packed block records)
/// and the data file (blob bytes). Paths may be rewritten to a numbered
/// alternate if the requested pair cannot be locked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the index file
    pub index_path: PathBuf,
    /// Path of the data file
    pub data_path: PathBuf,
    /// Open for reading only (shared lock, no mutation)
    pub read_only: bool,
    /// Size in bytes to extend a freshly created data file to (0 = none)
    pub presize: u32,
    /// Discard the store on open when the previous run left it open
    pub remove_after_crash: bool,
}

impl StoreConfig {
    /// Create a writable configuration for the given file pair
    pub fn new(index_path: impl AsRef<Path>, data_path: impl AsRef<Path>) -> Self {
        Self {
            index_path: index_path.as_ref().to_path_buf(),
            data_path: data_path.as_ref().to_path_buf(),
            read_only: false,
            presize: 0,
            remove_after_crash: false,
        }
    }

    /// Open the store read-only
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Pre-size a freshly created data file
    #[must_use]
    pub fn presize(mut self, bytes: u32) -> Self {
        self.presize = bytes;
        self
    }

    /// Enable crash-marker recovery
    #[must_use]
    pub fn remove_after_crash(mut self, enabled: bool) -> Self {
        self.remove_after_crash = enabled;
        self
    }
}
