//! Error types for the vcache asset store

use thiserror::Error;

/// Common result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at store boundaries
///
/// Runtime bounds problems and unknown keys are not errors: they are
/// clamped or ignored at the operation and reported through return values
/// and log lines. This enum covers the open-time failures that leave the
/// caller without a usable store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open store read-only: {0}")]
    CannotOpenReadOnly(String),

    #[error("cannot create store: {0}")]
    CannotCreate(String),

    #[error("store is corrupt: {0}")]
    Corrupt(String),
}

impl Error {
    /// Create a cannot-open-read-only error
    pub fn cannot_open_read_only(msg: impl Into<String>) -> Self {
        Self::CannotOpenReadOnly(msg.into())
    }

    /// Create a cannot-create error
    pub fn cannot_create(msg: impl Into<String>) -> Self {
        Self::CannotCreate(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Check if this error means the on-disk state was discarded
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}
