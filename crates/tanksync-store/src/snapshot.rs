//! SQLite snapshots of a [`ReadingStore`].
//!
//! The in-memory store is authoritative while the engine runs. A snapshot
//! lets a restarted process resume with its cached readings and complete
//! windows instead of backfilling everything again.

use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, info};

use tanksync_types::{Reading, TimeRange, Timestamp};

use crate::error::{Error, Result};
use crate::schema;
use crate::store::ReadingStore;

/// Summary of a saved snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Readings written.
    pub readings: usize,
    /// Windows written.
    pub windows: usize,
}

/// SQLite database holding one snapshot of a [`ReadingStore`].
pub struct SnapshotDb {
    conn: Connection,
}

impl SnapshotDb {
    /// Open or create a snapshot database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening snapshot database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Replace the stored snapshot with the contents of `store`.
    ///
    /// Runs in a single transaction; a failed save leaves the previous
    /// snapshot intact.
    pub fn save(&mut self, store: &ReadingStore) -> Result<SnapshotSummary> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM readings", [])?;
        tx.execute("DELETE FROM windows", [])?;

        let mut summary = SnapshotSummary::default();
        {
            let mut insert_reading = tx.prepare(
                "INSERT INTO readings (sensor_id, sequence, timestamp_ms, value)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut insert_window = tx.prepare(
                "INSERT INTO windows (sensor_id, start_ms, end_ms) VALUES (?1, ?2, ?3)",
            )?;

            for sensor_id in store.sensors() {
                for reading in store.readings(&sensor_id) {
                    let sequence = i64::try_from(reading.sequence).map_err(|_| {
                        Error::Corrupt(format!(
                            "sequence {} of {} does not fit in SQLite INTEGER",
                            reading.sequence, sensor_id
                        ))
                    })?;
                    insert_reading.execute(rusqlite::params![
                        sensor_id,
                        sequence,
                        reading.timestamp.as_millis(),
                        reading.value
                    ])?;
                    summary.readings += 1;
                }
                for window in store.windows(&sensor_id) {
                    insert_window.execute(rusqlite::params![
                        sensor_id,
                        window.start.as_millis(),
                        window.end.as_millis()
                    ])?;
                    summary.windows += 1;
                }
            }
        }

        tx.commit()?;
        debug!(
            readings = summary.readings,
            windows = summary.windows,
            "Saved snapshot"
        );
        Ok(summary)
    }

    /// Rebuild a [`ReadingStore`] from the stored snapshot.
    pub fn load(&self) -> Result<ReadingStore> {
        let mut store = ReadingStore::new();

        let mut stmt = self.conn.prepare(
            "SELECT sensor_id, sequence, timestamp_ms, value FROM readings
             ORDER BY sensor_id, sequence",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;
        for row in rows {
            let (sensor_id, sequence, ts, value) = row?;
            let sequence = u64::try_from(sequence)
                .map_err(|_| Error::Corrupt(format!("negative sequence {sequence} for {sensor_id}")))?;
            let _ = store.insert(Reading::new(sensor_id, sequence, Timestamp::from_millis(ts), value));
        }

        let mut stmt = self
            .conn
            .prepare("SELECT sensor_id, start_ms, end_ms FROM windows")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (sensor_id, start, end) = row?;
            let window = TimeRange::from_millis(start, end)
                .map_err(|e| Error::Corrupt(format!("window of {sensor_id}: {e}")))?;
            store.mark_window_complete(&sensor_id, window);
        }

        info!(readings = store.len(), "Loaded snapshot");
        Ok(store)
    }

    /// Number of readings in the stored snapshot.
    pub fn reading_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_store() -> ReadingStore {
        let mut store = ReadingStore::new();
        for seq in 1..=5u64 {
            let _ = store.insert(Reading::new(
                "tank/ph",
                seq,
                Timestamp::from_millis(seq as i64 * 1_000),
                7.0 + seq as f64 / 10.0,
            ));
        }
        store.mark_window_complete("tank/ph", TimeRange::from_millis(1_000, 3_001).unwrap());
        store.mark_window_complete("tank/ph", TimeRange::from_millis(5_000, 5_001).unwrap());
        store
    }

    #[test]
    fn test_save_and_load_in_memory() {
        let mut db = SnapshotDb::open_in_memory().unwrap();
        let store = sample_store();

        let summary = db.save(&store).unwrap();
        assert_eq!(summary.readings, 5);
        assert_eq!(summary.windows, 2);

        let loaded = db.load().unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded.readings("tank/ph"), store.readings("tank/ph"));
        assert_eq!(loaded.windows("tank/ph"), store.windows("tank/ph"));
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let mut db = SnapshotDb::open_in_memory().unwrap();
        db.save(&sample_store()).unwrap();

        let mut smaller = sample_store();
        let _ = smaller.evict_oldest(crate::RetentionLimit::Count(2));
        db.save(&smaller).unwrap();

        assert_eq!(db.reading_count().unwrap(), 2);
        let loaded = db.load().unwrap();
        assert_eq!(loaded.last_sequence("tank/ph"), Some(5));
        assert!(!loaded.contains("tank/ph", 1));
    }

    #[test]
    fn test_snapshot_on_disk_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.db");

        {
            let mut db = SnapshotDb::open(&path).unwrap();
            db.save(&sample_store()).unwrap();
        }

        let db = SnapshotDb::open(&path).unwrap();
        let loaded = db.load().unwrap();
        assert_eq!(loaded.len(), 5);
        let range = TimeRange::from_millis(1_000, 3_001).unwrap();
        assert!(loaded.range_query("tank/ph", &range).is_complete());
    }
}
