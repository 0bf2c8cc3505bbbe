//! SQLite persistence of sampling-rate estimators
//!
//! One row per signal, keyed by [`Signal::storage_key`]. Signal and
//! estimation are stored as JSON text.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{Result, StorageError};
use crate::estimation::SamplingRateEstimation;
use crate::types::{now_millis, Signal};

const ESTIMATION_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS lod_rate_estimation (
    signal_key      TEXT PRIMARY KEY,
    signal          TEXT NOT NULL,
    rate_estimation TEXT NOT NULL,
    last_update     INTEGER NOT NULL
);
";

/// Durable store for [`SamplingRateEstimation`] values
pub struct EstimationStore {
    conn: Mutex<Connection>,
}

impl EstimationStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(StorageError::from)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(StorageError::from)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(StorageError::from)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(ESTIMATION_SCHEMA)
            .map_err(StorageError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load every stored estimator
    ///
    /// Rows that fail to deserialize are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<(Signal, SamplingRateEstimation)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT signal_key, signal, rate_estimation FROM lod_rate_estimation")
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(StorageError::from)?;

        let mut loaded = Vec::new();
        for row in rows {
            let (key, signal, estimation) = row.map_err(StorageError::from)?;
            match (
                serde_json::from_str::<Signal>(&signal),
                serde_json::from_str::<SamplingRateEstimation>(&estimation),
            ) {
                (Ok(signal), Ok(estimation)) => loaded.push((signal, estimation)),
                _ => tracing::warn!(signal = %key, "Skipping unreadable rate estimation row"),
            }
        }
        Ok(loaded)
    }

    /// Insert or replace estimators in one transaction
    pub fn upsert(&self, entries: &[(Signal, SamplingRateEstimation)]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StorageError::from)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO lod_rate_estimation \
                     (signal_key, signal, rate_estimation, last_update) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(StorageError::from)?;
            let now = now_millis();
            for (signal, estimation) in entries {
                stmt.execute(rusqlite::params![
                    signal.storage_key().map_err(StorageError::from)?,
                    serde_json::to_string(signal).map_err(StorageError::from)?,
                    serde_json::to_string(estimation).map_err(StorageError::from)?,
                    now,
                ])
                .map_err(StorageError::from)?;
            }
        }
        tx.commit().map_err(StorageError::from)?;
        Ok(entries.len())
    }

    /// Delete the row of one signal, returning whether it existed
    pub fn delete(&self, signal: &Signal) -> Result<bool> {
        let key = signal.storage_key().map_err(StorageError::from)?;
        let deleted = self
            .conn
            .lock()
            .execute(
                "DELETE FROM lod_rate_estimation WHERE signal_key = ?1",
                rusqlite::params![key],
            )
            .map_err(StorageError::from)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataSource, TimedLocationValue};
    use tempfile::TempDir;

    fn signal(name: &str) -> Signal {
        Signal::new(DataSource::new("gsn", name), "temp", "timed")
    }

    fn estimation() -> SamplingRateEstimation {
        let mut e = SamplingRateEstimation::new(1_710_504_000_000).unwrap();
        let samples: Vec<_> = (0..5)
            .map(|i| TimedLocationValue::new(1_710_504_000_000 + i * 1000, 0.0))
            .collect();
        e.update_estimation(&samples).unwrap();
        e
    }

    #[test]
    fn test_upsert_load_delete() {
        let store = EstimationStore::open_in_memory().unwrap();
        let entries = vec![(signal("a"), estimation()), (signal("b"), estimation())];
        assert_eq!(store.upsert(&entries).unwrap(), 2);
        // replacing keeps one row per signal
        store.upsert(&entries[..1]).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by_key(|(s, _)| s.unique_key());
        assert_eq!(loaded, entries);

        assert!(store.delete(&signal("a")).unwrap());
        assert!(!store.delete(&signal("a")).unwrap());
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_location_fields_keep_rows_apart() {
        let store = EstimationStore::open_in_memory().unwrap();
        let a = signal("bus").with_location("lat", "lng");
        let b = signal("bus").with_location("latitude", "longitude");
        store
            .upsert(&[(a.clone(), estimation()), (b.clone(), estimation())])
            .unwrap();
        assert_eq!(store.load_all().unwrap().len(), 2);

        assert!(store.delete(&b).unwrap());
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, a);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("estimation.db");
        {
            let store = EstimationStore::open(&path).unwrap();
            store.upsert(&[(signal("a"), estimation())]).unwrap();
        }
        let store = EstimationStore::open(&path).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
