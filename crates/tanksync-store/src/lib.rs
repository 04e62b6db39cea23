//! Local reading cache for aquarium telemetry.
//!
//! This crate holds the readings the sync engine has ingested, ordered by
//! time and deduplicated by sequence, together with the set of time windows
//! known to be complete. Queries only return data from complete windows and
//! report the rest as uncovered.
//!
//! # Features
//!
//! - Idempotent inserts keyed by `(sensor_id, sequence)`
//! - Covered-window bookkeeping with coalescing of adjacent ranges
//! - Oldest-first retention bounded by count, approximate bytes or age
//! - SQLite snapshots for warm restarts
//!
//! # Example
//!
//! ```no_run
//! use tanksync_store::{ReadingStore, SnapshotDb};
//!
//! let mut db = SnapshotDb::open_default()?;
//! let store: ReadingStore = db.load()?;
//! println!("{} cached readings", store.len());
//! db.save(&store)?;
//! # Ok::<(), tanksync_store::Error>(())
//! ```

mod error;
mod retention;
mod schema;
mod snapshot;
mod store;
mod windows;

pub use error::{Error, Result};
pub use retention::{BYTES_PER_READING, Eviction, RetentionLimit};
pub use snapshot::{SnapshotDb, SnapshotSummary};
pub use store::{InsertOutcome, RangeResult, ReadingStore, StoreStats};
pub use windows::WindowSet;

/// Default snapshot path following platform conventions.
///
/// - Linux: `~/.local/share/tanksync/cache.db`
/// - macOS: `~/Library/Application Support/tanksync/cache.db`
/// - Windows: `C:\Users\<user>\AppData\Local\tanksync\cache.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("tanksync")
        .join("cache.db")
}
