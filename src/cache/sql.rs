//! Durable cache tier backed by SQLite
//!
//! # Schema
//!
//! ```text
//! {prefix}signals   signal_id, signal_key, signal (JSON)
//! {prefix}metadata  entry_id, signal_id, window_length, has_location,
//!                   start_time, end_time, first_packet, last_packet,
//!                   last_update, num_elements, hits
//! {prefix}values    entry_id, time_idx, value, lat, lng
//! ```
//!
//! Signal ids and per-entry metadata are mirrored in memory and loaded on
//! open, so membership and timestamp queries never touch the database. Only
//! value reads/writes and the metadata sync after a write do.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;

use crate::aggregation::{
    aggregate_mean_null_location, aggregate_mean_with_location, truncate_timestamp, width_millis,
};
use crate::cache::tier::{CacheTier, TierBackend, TierCounters, TierStats};
use crate::error::{Error, Result, StorageError};
use crate::storage::{StoragePolicy, LOCATED_ELEMENT_BYTES, VALUE_ELEMENT_BYTES};
use crate::types::{now_millis, CachedDataInfo, Location, Signal, TimedLocationValue};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
struct EntryMeta {
    entry_id: i64,
    has_location: bool,
    start_time: i64,
    end_time: Option<i64>,
    first_packet: Option<i64>,
    last_packet: Option<i64>,
    last_update: Option<i64>,
    num_elements: usize,
    hits: u64,
}

#[derive(Debug, Default)]
struct SqlIndex {
    signal_ids: HashMap<Signal, i64>,
    order: Vec<Signal>,
    entries: HashMap<(Signal, u32), EntryMeta>,
}

impl SqlIndex {
    fn remember(&mut self, signal: Signal, id: i64) {
        if self.signal_ids.insert(signal.clone(), id).is_none() {
            self.order.push(signal);
        }
    }
}

/// Cache tier persisting aggregates in SQLite
pub struct SqlTier {
    conn: Mutex<Connection>,
    prefix: String,
    index: RwLock<SqlIndex>,
    policy: StoragePolicy,
    counters: TierCounters,
    initialized: AtomicBool,
}

impl SqlTier {
    /// Open or create the tables named `{prefix}*` in the database at `path`
    pub fn open(path: &Path, prefix: &str, policy: StoragePolicy) -> Result<Self> {
        let conn = Connection::open(path).map_err(StorageError::from)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(StorageError::from)?;
        let tier = Self::with_connection(conn, prefix, policy)?;
        let (signals, entries) = {
            let index = tier.index.read();
            (index.order.len(), index.entries.len())
        };
        tracing::info!(
            path = %path.display(),
            prefix,
            signals,
            entries,
            "Opened SQL cache tier"
        );
        Ok(tier)
    }

    /// Open a tier on a private in-memory database (for testing)
    pub fn open_in_memory(prefix: &str, policy: StoragePolicy) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        Self::with_connection(conn, prefix, policy)
    }

    fn with_connection(conn: Connection, prefix: &str, policy: StoragePolicy) -> Result<Self> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Configuration(format!(
                "invalid SQL table prefix '{}'",
                prefix
            )));
        }
        conn.busy_timeout(BUSY_TIMEOUT).map_err(StorageError::from)?;
        conn.execute_batch(&schema(prefix))
            .map_err(StorageError::from)?;

        let tier = Self {
            conn: Mutex::new(conn),
            prefix: prefix.to_string(),
            index: RwLock::new(SqlIndex::default()),
            policy,
            counters: TierCounters::new(),
            initialized: AtomicBool::new(false),
        };
        tier.load_index()?;
        tier.initialized.store(true, Ordering::Release);
        Ok(tier)
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn load_index(&self) -> Result<()> {
        let conn = self.conn.lock();
        let mut index = SqlIndex::default();
        let mut by_id: HashMap<i64, Signal> = HashMap::new();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT signal_id, signal_key, signal FROM {} ORDER BY signal_id",
                self.table("signals")
            ))
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(StorageError::from)?;
        for row in rows {
            let (id, key, json) = row.map_err(StorageError::from)?;
            match serde_json::from_str::<Signal>(&json) {
                Ok(signal) => {
                    by_id.insert(id, signal.clone());
                    index.remember(signal, id);
                }
                Err(e) => tracing::warn!(signal = %key, error = %e, "Skipping unreadable signal row"),
            }
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT entry_id, signal_id, window_length, has_location, start_time, end_time, \
                 first_packet, last_packet, last_update, num_elements, hits FROM {}",
                self.table("metadata")
            ))
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(1)?,
                    row.get::<_, u32>(2)?,
                    EntryMeta {
                        entry_id: row.get(0)?,
                        has_location: row.get(3)?,
                        start_time: row.get(4)?,
                        end_time: row.get(5)?,
                        first_packet: row.get(6)?,
                        last_packet: row.get(7)?,
                        last_update: row.get(8)?,
                        num_elements: row.get::<_, i64>(9)?.max(0) as usize,
                        hits: row.get::<_, i64>(10)?.max(0) as u64,
                    },
                ))
            })
            .map_err(StorageError::from)?;
        for row in rows {
            let (signal_id, width, meta) = row.map_err(StorageError::from)?;
            if let Some(signal) = by_id.get(&signal_id) {
                index.entries.insert((signal.clone(), width), meta);
            }
        }

        *self.index.write() = index;
        Ok(())
    }

    fn ensure_signal(&self, conn: &Connection, signal: &Signal) -> Result<i64> {
        if let Some(id) = self.index.read().signal_ids.get(signal) {
            return Ok(*id);
        }
        let key = signal.storage_key().map_err(StorageError::from)?;
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (signal_key, signal) VALUES (?1, ?2)",
                self.table("signals")
            ),
            rusqlite::params![key, serde_json::to_string(signal).map_err(StorageError::from)?],
        )
        .map_err(StorageError::from)?;
        let id: i64 = conn
            .query_row(
                &format!("SELECT signal_id FROM {} WHERE signal_key = ?1", self.table("signals")),
                rusqlite::params![key],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        self.index.write().remember(signal.clone(), id);
        Ok(id)
    }

    fn meta(&self, signal: &Signal, width_secs: u32) -> Option<EntryMeta> {
        self.index
            .read()
            .entries
            .get(&(signal.clone(), width_secs))
            .cloned()
    }

    fn write_batch(
        &self,
        signal: &Signal,
        width_secs: u32,
        samples: &[TimedLocationValue],
    ) -> Result<EntryMeta> {
        let has_location = signal.has_location();
        let aggregated = if has_location {
            aggregate_mean_with_location(samples, width_secs, self.policy.location_decimals)
        } else {
            aggregate_mean_null_location(samples, width_secs)
        };

        let mut conn = self.conn.lock();
        let signal_id = self.ensure_signal(&conn, signal)?;
        let width = width_millis(width_secs);

        let tx = conn.transaction().map_err(StorageError::from)?;
        let mut meta = match self.meta(signal, width_secs) {
            Some(meta) => meta,
            None => {
                let start_time = truncate_timestamp(samples[0].timestamp, width_secs);
                tx.execute(
                    &format!(
                        "INSERT INTO {} (signal_id, window_length, has_location, start_time) \
                         VALUES (?1, ?2, ?3, ?4)",
                        self.table("metadata")
                    ),
                    rusqlite::params![signal_id, width_secs, has_location, start_time],
                )
                .map_err(StorageError::from)?;
                EntryMeta {
                    entry_id: tx.last_insert_rowid(),
                    has_location,
                    start_time,
                    end_time: None,
                    first_packet: None,
                    last_packet: None,
                    last_update: None,
                    num_elements: 0,
                    hits: 0,
                }
            }
        };

        let anchor = meta.start_time;
        let rows: Vec<(i64, &TimedLocationValue)> = aggregated
            .iter()
            .filter_map(|v| {
                if v.timestamp < anchor {
                    tracing::warn!(timestamp = v.timestamp, anchor, "Dropping bucket before entry start");
                    return None;
                }
                Some(((v.timestamp - anchor) / width, v))
            })
            .collect();

        if let Some((first_idx, _)) = rows.first() {
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE entry_id = ?1 AND time_idx >= ?2",
                    self.table("values")
                ),
                rusqlite::params![meta.entry_id, first_idx],
            )
            .map_err(StorageError::from)?;

            let mut insert = tx
                .prepare(&format!(
                    "INSERT INTO {} (entry_id, time_idx, value, lat, lng) VALUES (?1, ?2, ?3, ?4, ?5)",
                    self.table("values")
                ))
                .map_err(StorageError::from)?;
            for (idx, v) in &rows {
                insert
                    .execute(rusqlite::params![
                        meta.entry_id,
                        idx,
                        v.value,
                        v.location.map(|l| l.latitude),
                        v.location.map(|l| l.longitude),
                    ])
                    .map_err(StorageError::from)?;
            }
        }

        let (count, max_idx): (i64, Option<i64>) = tx
            .query_row(
                &format!(
                    "SELECT COUNT(*), MAX(time_idx) FROM {} WHERE entry_id = ?1",
                    self.table("values")
                ),
                rusqlite::params![meta.entry_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StorageError::from)?;

        let first_ts = samples[0].timestamp;
        let last_ts = samples[samples.len() - 1].timestamp;
        meta.num_elements = count.max(0) as usize;
        meta.end_time = max_idx.map(|idx| anchor + idx * width);
        meta.first_packet = Some(meta.first_packet.map_or(first_ts, |f| f.min(first_ts)));
        meta.last_packet = Some(meta.last_packet.map_or(last_ts, |l| l.max(last_ts)));
        meta.last_update = Some(now_millis());

        tx.execute(
            &format!(
                "UPDATE {} SET end_time = ?1, first_packet = ?2, last_packet = ?3, \
                 last_update = ?4, num_elements = ?5, hits = ?6 WHERE entry_id = ?7",
                self.table("metadata")
            ),
            rusqlite::params![
                meta.end_time,
                meta.first_packet,
                meta.last_packet,
                meta.last_update,
                meta.num_elements as i64,
                meta.hits as i64,
                meta.entry_id,
            ],
        )
        .map_err(StorageError::from)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(meta)
    }

    fn read_values(
        &self,
        meta: &EntryMeta,
        width_secs: u32,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<TimedLocationValue>> {
        let Some(end_time) = meta.end_time else {
            return Ok(Vec::new());
        };
        let start = start.map_or(meta.start_time, |s| s.max(meta.start_time));
        let end = end.map_or(end_time, |e| e.min(end_time));
        if start > end {
            return Ok(Vec::new());
        }
        let width = width_millis(width_secs);
        let first_idx = (start - meta.start_time) / width;
        let last_idx = (end - meta.start_time) / width;

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT time_idx, value, lat, lng FROM {} \
                 WHERE entry_id = ?1 AND time_idx >= ?2 AND time_idx <= ?3 \
                 ORDER BY time_idx, rowid",
                self.table("values")
            ))
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(rusqlite::params![meta.entry_id, first_idx, last_idx], |row| {
                let idx: i64 = row.get(0)?;
                let lat: Option<f64> = row.get(2)?;
                let lng: Option<f64> = row.get(3)?;
                Ok(TimedLocationValue {
                    timestamp: meta.start_time + idx * width,
                    value: row.get(1)?,
                    location: lat.zip(lng).map(|(lat, lng)| Location::new(lat, lng)),
                })
            })
            .map_err(StorageError::from)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(StorageError::from)?);
        }
        Ok(out)
    }
}

fn schema(prefix: &str) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS {p}signals (
    signal_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    signal_key  TEXT NOT NULL UNIQUE,
    signal      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS {p}metadata (
    entry_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    signal_id     INTEGER NOT NULL,
    window_length INTEGER NOT NULL,
    has_location  INTEGER NOT NULL,
    start_time    INTEGER NOT NULL,
    end_time      INTEGER,
    first_packet  INTEGER,
    last_packet   INTEGER,
    last_update   INTEGER,
    num_elements  INTEGER NOT NULL DEFAULT 0,
    hits          INTEGER NOT NULL DEFAULT 0,
    UNIQUE (signal_id, window_length)
);
CREATE TABLE IF NOT EXISTS {p}values (
    entry_id  INTEGER NOT NULL,
    time_idx  INTEGER NOT NULL,
    value     REAL NOT NULL,
    lat       REAL,
    lng       REAL
);
CREATE INDEX IF NOT EXISTS {p}values_entry_idx ON {p}values (entry_id, time_idx);
",
        p = prefix
    )
}

impl CacheTier for SqlTier {
    fn backend(&self) -> TierBackend {
        TierBackend::Sql
    }

    fn description(&self) -> String {
        format!(
            "SQLite tier '{}' ({} entries)",
            self.prefix,
            self.index.read().entries.len()
        )
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn update_entry(
        &self,
        signal: &Signal,
        width_secs: u32,
        samples: &[TimedLocationValue],
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let meta = self.write_batch(signal, width_secs, samples)?;
        tracing::debug!(
            signal = %signal,
            width = width_secs,
            elements = meta.num_elements,
            "Updated SQL cache entry"
        );
        self.index
            .write()
            .entries
            .insert((signal.clone(), width_secs), meta);
        Ok(())
    }

    fn signal_data(
        &self,
        signal: &Signal,
        width_secs: u32,
        start: Option<i64>,
        end: Option<i64>,
        update_stats: bool,
    ) -> Result<Option<Vec<TimedLocationValue>>> {
        let Some(meta) = self.meta(signal, width_secs) else {
            if update_stats {
                self.counters.record_miss();
            }
            return Ok(None);
        };
        let data = self.read_values(&meta, width_secs, start, end)?;
        if update_stats {
            self.counters.record_hit();
            if let Some(m) = self
                .index
                .write()
                .entries
                .get_mut(&(signal.clone(), width_secs))
            {
                m.hits += 1;
            }
        }
        Ok(Some(data))
    }

    fn is_in_cache(&self, signal: &Signal, width_secs: u32) -> bool {
        self.meta(signal, width_secs)
            .is_some_and(|m| m.last_update.is_some())
    }

    fn start_time(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.meta(signal, width_secs).map(|m| m.start_time)
    }

    fn end_time(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.meta(signal, width_secs).and_then(|m| m.end_time)
    }

    fn first_packet_timestamp(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.meta(signal, width_secs).and_then(|m| m.first_packet)
    }

    fn last_packet_timestamp(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.meta(signal, width_secs).and_then(|m| m.last_packet)
    }

    fn last_update(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.meta(signal, width_secs).and_then(|m| m.last_update)
    }

    fn add_signal(&self, signal: &Signal) -> Result<()> {
        let conn = self.conn.lock();
        self.ensure_signal(&conn, signal)?;
        Ok(())
    }

    fn remove_signal(&self, signal: &Signal) -> Result<bool> {
        let Some(signal_id) = self.index.read().signal_ids.get(signal).copied() else {
            return Ok(true);
        };

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(StorageError::from)?;
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE entry_id IN (SELECT entry_id FROM {} WHERE signal_id = ?1)",
                    self.table("values"),
                    self.table("metadata")
                ),
                rusqlite::params![signal_id],
            )
            .map_err(StorageError::from)?;
            tx.execute(
                &format!("DELETE FROM {} WHERE signal_id = ?1", self.table("metadata")),
                rusqlite::params![signal_id],
            )
            .map_err(StorageError::from)?;
            tx.execute(
                &format!("DELETE FROM {} WHERE signal_id = ?1", self.table("signals")),
                rusqlite::params![signal_id],
            )
            .map_err(StorageError::from)?;
            tx.commit().map_err(StorageError::from)?;
        }

        let mut index = self.index.write();
        index.signal_ids.remove(signal);
        index.order.retain(|s| s != signal);
        index.entries.retain(|(s, _), _| s != signal);
        Ok(true)
    }

    fn signals(&self) -> Vec<Signal> {
        self.index.read().order.clone()
    }

    fn cached_data_info(&self) -> Vec<CachedDataInfo> {
        self.index
            .read()
            .entries
            .iter()
            .map(|((signal, width), meta)| CachedDataInfo {
                signal: signal.clone(),
                bucket_width: *width,
                num_elements: meta.num_elements,
                has_location: meta.has_location,
                last_update: meta.last_update,
                last_packet_timestamp: meta.last_packet,
                hits: meta.hits,
            })
            .collect()
    }

    fn stats(&self) -> TierStats {
        let index = self.index.read();
        let size_bytes = index
            .entries
            .values()
            .map(|m| {
                m.num_elements
                    * if m.has_location {
                        LOCATED_ELEMENT_BYTES
                    } else {
                        VALUE_ELEMENT_BYTES
                    }
            })
            .sum();
        self.counters
            .snapshot(TierBackend::Sql, index.entries.len(), index.order.len(), size_bytes)
    }
}

impl SqlTier {
    /// Number of value rows stored for an entry, read from the database
    pub fn stored_rows(&self, signal: &Signal, width_secs: u32) -> Result<Option<usize>> {
        let Some(meta) = self.meta(signal, width_secs) else {
            return Ok(None);
        };
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE entry_id = ?1", self.table("values")),
                rusqlite::params![meta.entry_id],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        Ok(Some(count.max(0) as usize))
    }
}
