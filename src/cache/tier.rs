//! Cache tier contract
//!
//! Every backend stores, per (signal, bucket width), the aggregate produced
//! from the batches written to it, and answers range reads plus the metadata
//! queries the manager and scheduler need. Methods are synchronous; a
//! backend guards its own state and never holds a lock across calls.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Result;
use crate::types::{CachedDataInfo, Signal, TimedLocationValue};

/// Storage backend of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierBackend {
    /// Process memory
    Memory,
    /// SQLite database
    Sql,
}

impl TierBackend {
    /// Get backend label as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TierBackend::Memory => "memory",
            TierBackend::Sql => "sql",
        }
    }
}

impl fmt::Display for TierBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a tier's size and request counters
#[derive(Debug, Clone, PartialEq)]
pub struct TierStats {
    /// Backend label
    pub backend: TierBackend,
    /// Cached (signal, width) entries
    pub entries: usize,
    /// Known signals, including ones without data yet
    pub signals: usize,
    /// Approximate bytes held by stored elements
    pub size_bytes: usize,
    /// Counted read requests
    pub requests: u64,
    /// Requests answered from an entry
    pub hits: u64,
    /// Requests for which no entry existed
    pub misses: u64,
    /// Seconds since the tier was created
    pub uptime_secs: u64,
}

impl TierStats {
    /// Fraction of counted requests that hit
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }
}

/// Request counters shared by the tier implementations
#[derive(Debug)]
pub struct TierCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    started: Instant,
}

impl Default for TierCounters {
    fn default() -> Self {
        Self {
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl TierCounters {
    /// Create zeroed counters, starting the uptime clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an answered request
    pub fn record_hit(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request without matching entry
    pub fn record_miss(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Build a stats snapshot from these counters and the given sizes
    pub fn snapshot(
        &self,
        backend: TierBackend,
        entries: usize,
        signals: usize,
        size_bytes: usize,
    ) -> TierStats {
        TierStats {
            backend,
            entries,
            signals,
            size_bytes,
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// One cache backend holding aggregates at one or more bucket widths
pub trait CacheTier: Send + Sync {
    /// Backend label for diagnostics
    fn backend(&self) -> TierBackend;

    /// Human-readable description
    fn description(&self) -> String;

    /// Whether the tier finished its start-up (schema, index load)
    fn is_initialized(&self) -> bool;

    /// Aggregate `samples` at `width_secs` and write them for `signal`
    ///
    /// Creates the entry on first write. Existing buckets covered by the
    /// batch are superseded.
    fn update_entry(
        &self,
        signal: &Signal,
        width_secs: u32,
        samples: &[TimedLocationValue],
    ) -> Result<()>;

    /// Read cached samples within optional bounds
    ///
    /// Returns `Ok(None)` if no entry exists. With `update_stats` the read is
    /// counted as a hit or miss.
    fn signal_data(
        &self,
        signal: &Signal,
        width_secs: u32,
        start: Option<i64>,
        end: Option<i64>,
        update_stats: bool,
    ) -> Result<Option<Vec<TimedLocationValue>>>;

    /// Whether an entry with data exists
    fn is_in_cache(&self, signal: &Signal, width_secs: u32) -> bool;

    /// Start of the first stored bucket
    fn start_time(&self, signal: &Signal, width_secs: u32) -> Option<i64>;

    /// Start of the last stored bucket
    fn end_time(&self, signal: &Signal, width_secs: u32) -> Option<i64>;

    /// Oldest raw sample seen
    fn first_packet_timestamp(&self, signal: &Signal, width_secs: u32) -> Option<i64>;

    /// Newest raw sample seen
    fn last_packet_timestamp(&self, signal: &Signal, width_secs: u32) -> Option<i64>;

    /// Time of the last successful write
    fn last_update(&self, signal: &Signal, width_secs: u32) -> Option<i64>;

    /// Register a signal without data
    fn add_signal(&self, signal: &Signal) -> Result<()>;

    /// Remove a signal and all its entries
    ///
    /// Returns `true` once the signal is gone, including when it was never
    /// known.
    fn remove_signal(&self, signal: &Signal) -> Result<bool>;

    /// Every known signal
    fn signals(&self) -> Vec<Signal>;

    /// Metadata snapshot of every entry
    fn cached_data_info(&self) -> Vec<CachedDataInfo>;

    /// Size and request counters
    fn stats(&self) -> TierStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = TierCounters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        let stats = counters.snapshot(TierBackend::Memory, 2, 3, 64);
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.backend.to_string(), "memory");
    }
}
