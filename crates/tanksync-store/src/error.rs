//! Error types for tanksync-store.

use std::path::PathBuf;

/// Result type for tanksync-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tanksync-store.
///
/// The in-memory [`ReadingStore`](crate::ReadingStore) never fails; these
/// errors come from snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The database was written by a schema this build cannot read.
    #[error("Unsupported snapshot schema version {found} (expected {supported})")]
    UnsupportedSchema { found: i32, supported: i32 },

    /// A snapshot row could not be turned back into a valid value.
    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
