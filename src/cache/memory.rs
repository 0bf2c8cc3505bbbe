//! In-memory cache tier
//!
//! Entries live in a [`DashMap`] keyed by (signal, bucket width). Each entry
//! sits behind its own `RwLock`, so a refresh rewriting one signal never
//! blocks reads of another. Readers may see the state before or after a
//! concurrent write, never a torn bucket.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::cache::tier::{CacheTier, TierBackend, TierCounters, TierStats};
use crate::error::Result;
use crate::storage::{IndexedEntry, StoragePolicy};
use crate::types::{CachedDataInfo, Signal, TimedLocationValue};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    signal: Signal,
    width_secs: u32,
}

impl EntryKey {
    fn new(signal: &Signal, width_secs: u32) -> Self {
        Self {
            signal: signal.clone(),
            width_secs,
        }
    }
}

/// Cache tier backed by process memory
pub struct MemoryTier {
    entries: DashMap<EntryKey, Arc<RwLock<IndexedEntry>>>,
    known: RwLock<Vec<Signal>>,
    policy: StoragePolicy,
    counters: TierCounters,
}

impl MemoryTier {
    /// Create an empty tier
    pub fn new(policy: StoragePolicy) -> Self {
        Self {
            entries: DashMap::new(),
            known: RwLock::new(Vec::new()),
            policy,
            counters: TierCounters::new(),
        }
    }

    fn entry(&self, signal: &Signal, width_secs: u32) -> Option<Arc<RwLock<IndexedEntry>>> {
        self.entries
            .get(&EntryKey::new(signal, width_secs))
            .map(|e| Arc::clone(e.value()))
    }

    fn with_entry<T>(
        &self,
        signal: &Signal,
        width_secs: u32,
        f: impl FnOnce(&IndexedEntry) -> Option<T>,
    ) -> Option<T> {
        let entry = self.entry(signal, width_secs)?;
        let guard = entry.read();
        f(&guard)
    }

    fn remember(&self, signal: &Signal) {
        if self.known.read().contains(signal) {
            return;
        }
        let mut known = self.known.write();
        if !known.contains(signal) {
            known.push(signal.clone());
        }
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(StoragePolicy::default())
    }
}

impl CacheTier for MemoryTier {
    fn backend(&self) -> TierBackend {
        TierBackend::Memory
    }

    fn description(&self) -> String {
        format!("in-memory tier ({} entries)", self.entries.len())
    }

    fn is_initialized(&self) -> bool {
        true
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
        self.remember(signal);

        let existing = match self.entries.entry(EntryKey::new(signal, width_secs)) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                if let Some(entry) =
                    IndexedEntry::from_samples(signal.clone(), width_secs, samples, &self.policy)
                {
                    tracing::debug!(
                        signal = %signal,
                        width = width_secs,
                        elements = entry.num_elements(),
                        "Created memory cache entry"
                    );
                    vacant.insert(Arc::new(RwLock::new(entry)));
                }
                return Ok(());
            }
        };

        let written = existing.write().update_values(samples, &self.policy);
        tracing::debug!(signal = %signal, width = width_secs, written, "Updated memory cache entry");
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
        let Some(entry) = self.entry(signal, width_secs) else {
            if update_stats {
                self.counters.record_miss();
            }
            return Ok(None);
        };
        let guard = entry.read();
        if update_stats {
            self.counters.record_hit();
            guard.record_hit();
        }
        Ok(Some(guard.read(start, end)))
    }

    fn is_in_cache(&self, signal: &Signal, width_secs: u32) -> bool {
        self.entries.contains_key(&EntryKey::new(signal, width_secs))
    }

    fn start_time(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.with_entry(signal, width_secs, |e| Some(e.start_time()))
    }

    fn end_time(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.with_entry(signal, width_secs, IndexedEntry::end_time)
    }

    fn first_packet_timestamp(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.with_entry(signal, width_secs, IndexedEntry::first_packet_timestamp)
    }

    fn last_packet_timestamp(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.with_entry(signal, width_secs, IndexedEntry::last_packet_timestamp)
    }

    fn last_update(&self, signal: &Signal, width_secs: u32) -> Option<i64> {
        self.with_entry(signal, width_secs, IndexedEntry::last_update)
    }

    fn add_signal(&self, signal: &Signal) -> Result<()> {
        self.remember(signal);
        Ok(())
    }

    fn remove_signal(&self, signal: &Signal) -> Result<bool> {
        self.entries.retain(|key, _| &key.signal != signal);
        self.known.write().retain(|s| s != signal);
        Ok(true)
    }

    fn signals(&self) -> Vec<Signal> {
        self.known.read().clone()
    }

    fn cached_data_info(&self) -> Vec<CachedDataInfo> {
        self.entries
            .iter()
            .map(|e| e.value().read().info())
            .collect()
    }

    fn stats(&self) -> TierStats {
        let size_bytes = self
            .entries
            .iter()
            .map(|e| e.value().read().size_bytes())
            .sum();
        self.counters.snapshot(
            TierBackend::Memory,
            self.entries.len(),
            self.known.read().len(),
            size_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataSource;

    fn signal(name: &str) -> Signal {
        Signal::new(DataSource::new("gsn", name), "temp", "timed")
    }

    fn samples(start: i64, n: i64) -> Vec<TimedLocationValue> {
        (0..n)
            .map(|i| TimedLocationValue::new(start + i * 1000, i as f64))
            .collect()
    }

    #[test]
    fn test_write_then_read() {
        let tier = MemoryTier::default();
        let s = signal("a");
        assert!(!tier.is_in_cache(&s, 60));
        tier.update_entry(&s, 60, &samples(0, 180)).unwrap();

        assert!(tier.is_in_cache(&s, 60));
        assert!(!tier.is_in_cache(&s, 240));
        assert_eq!(tier.start_time(&s, 60), Some(0));
        assert_eq!(tier.end_time(&s, 60), Some(120_000));
        assert_eq!(tier.first_packet_timestamp(&s, 60), Some(0));
        assert_eq!(tier.last_packet_timestamp(&s, 60), Some(179_000));
        assert!(tier.last_update(&s, 60).is_some());

        let data = tier.signal_data(&s, 60, None, None, true).unwrap().unwrap();
        assert_eq!(data.len(), 3);
        assert!((data[0].value - 29.5).abs() < 1e-9);

        assert!(tier.signal_data(&s, 240, None, None, true).unwrap().is_none());
        let stats = tier.stats();
        assert_eq!((stats.requests, stats.hits, stats.misses), (2, 1, 1));
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size_bytes, 12);
        assert_eq!(tier.cached_data_info()[0].hits, 1);
    }

    #[test]
    fn test_incremental_update_supersedes_partial_bucket() {
        let tier = MemoryTier::default();
        let s = signal("a");
        tier.update_entry(&s, 60, &samples(0, 90)).unwrap();
        // second half of bucket 1 arrives, re-fetched from the bucket start
        tier.update_entry(&s, 60, &samples(60_000, 60)).unwrap();
        let data = tier.signal_data(&s, 60, Some(60_000), None, false).unwrap().unwrap();
        assert_eq!(data.len(), 1);
        assert!((data[0].value - 29.5).abs() < 1e-9);
    }

    #[test]
    fn test_add_and_remove_signal() {
        let tier = MemoryTier::default();
        let (a, b) = (signal("a"), signal("b"));
        tier.add_signal(&a).unwrap();
        tier.update_entry(&b, 60, &samples(0, 10)).unwrap();
        tier.update_entry(&b, 240, &samples(0, 10)).unwrap();
        assert_eq!(tier.signals(), vec![a.clone(), b.clone()]);
        assert!(!tier.is_in_cache(&a, 60));

        assert!(tier.remove_signal(&b).unwrap());
        assert_eq!(tier.signals(), vec![a]);
        assert!(tier.cached_data_info().is_empty());
        assert!(tier.remove_signal(&b).unwrap());
    }
}
