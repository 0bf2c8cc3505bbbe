//! Cached aggregate for one (signal, bucket width) pair

use std::sync::atomic::{AtomicU64, Ordering};

use crate::aggregation::{
    aggregate_mean, aggregate_mean_with_location, truncate_timestamp, width_millis,
};
use crate::storage::{LocatedIndex, StoragePolicy, ValueIndex};
use crate::types::{now_millis, CachedDataInfo, Signal, TimedLocationValue};

/// Approximate bytes per stored value-only element
pub const VALUE_ELEMENT_BYTES: usize = 4;

/// Approximate bytes per stored value+location element
pub const LOCATED_ELEMENT_BYTES: usize = 12;

/// Storage layout of an entry, picked from the signal's location flag
#[derive(Debug, Clone)]
pub enum EntryLayout {
    /// One value per bucket
    Values(ValueIndex),
    /// Several (value, location) pairs per bucket
    Located(LocatedIndex),
}

/// Per (signal, bucket width) cached aggregate plus bookkeeping
#[derive(Debug)]
pub struct IndexedEntry {
    signal: Signal,
    width_secs: u32,
    layout: EntryLayout,
    first_packet: Option<i64>,
    last_packet: Option<i64>,
    last_update: Option<i64>,
    hits: AtomicU64,
}

impl IndexedEntry {
    /// Build an entry from the first fetched batch
    ///
    /// The anchor is the bucket of the first sample and the arrays are sized
    /// to the batch's bucket span. Returns `None` for an empty batch.
    pub fn from_samples(
        signal: Signal,
        width_secs: u32,
        samples: &[TimedLocationValue],
        policy: &StoragePolicy,
    ) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;
        let anchor = truncate_timestamp(first.timestamp, width_secs);
        let span = ((last.timestamp - anchor).max(0) / width_millis(width_secs)) as usize + 1;

        let layout = if signal.has_location() {
            EntryLayout::Located(LocatedIndex::new(anchor, width_secs, span, span))
        } else {
            EntryLayout::Values(ValueIndex::new(anchor, width_secs, span))
        };

        let mut entry = Self {
            signal,
            width_secs,
            layout,
            first_packet: None,
            last_packet: None,
            last_update: None,
            hits: AtomicU64::new(0),
        };
        entry.update_values(samples, policy);
        Some(entry)
    }

    /// Aggregate `samples` at this entry's width and write them
    ///
    /// Returns the number of stored elements written.
    pub fn update_values(&mut self, samples: &[TimedLocationValue], policy: &StoragePolicy) -> usize {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return 0;
        };

        let written = match &mut self.layout {
            EntryLayout::Values(index) => {
                index.write(&aggregate_mean(samples, self.width_secs), policy)
            }
            EntryLayout::Located(index) => index.write(
                &aggregate_mean_with_location(samples, self.width_secs, policy.location_decimals),
                policy,
            ),
        };

        self.first_packet = Some(self.first_packet.map_or(first.timestamp, |f| f.min(first.timestamp)));
        self.last_packet = Some(self.last_packet.map_or(last.timestamp, |l| l.max(last.timestamp)));
        self.last_update = Some(now_millis());
        written
    }

    /// Read samples between optional bounds, clamped to the stored span
    pub fn read(&self, start: Option<i64>, end: Option<i64>) -> Vec<TimedLocationValue> {
        let Some(end_time) = self.end_time() else {
            return Vec::new();
        };
        let start = start.map_or(self.start_time(), |s| s.max(self.start_time()));
        let end = end.map_or(end_time, |e| e.min(end_time));
        if start > end {
            return Vec::new();
        }

        match &self.layout {
            EntryLayout::Values(index) => index
                .read(start, end)
                .into_iter()
                .map(TimedLocationValue::from)
                .collect(),
            EntryLayout::Located(index) => index.read(start, end),
        }
    }

    /// Count a served read
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// The cached signal
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Bucket width in seconds
    pub fn width_secs(&self) -> u32 {
        self.width_secs
    }

    /// Start of the first bucket
    pub fn start_time(&self) -> i64 {
        match &self.layout {
            EntryLayout::Values(index) => index.start_time(),
            EntryLayout::Located(index) => index.start_time(),
        }
    }

    /// Start of the last written bucket
    pub fn end_time(&self) -> Option<i64> {
        match &self.layout {
            EntryLayout::Values(index) => index.end_time(),
            EntryLayout::Located(index) => index.end_time(),
        }
    }

    /// Oldest raw sample timestamp written
    pub fn first_packet_timestamp(&self) -> Option<i64> {
        self.first_packet
    }

    /// Newest raw sample timestamp written
    pub fn last_packet_timestamp(&self) -> Option<i64> {
        self.last_packet
    }

    /// Time of the last write
    pub fn last_update(&self) -> Option<i64> {
        self.last_update
    }

    /// Reads served from this entry
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Stored elements
    pub fn num_elements(&self) -> usize {
        match &self.layout {
            EntryLayout::Values(index) => index.num_elements(),
            EntryLayout::Located(index) => index.num_elements(),
        }
    }

    /// Whether this entry keeps locations
    pub fn has_location(&self) -> bool {
        matches!(self.layout, EntryLayout::Located(_))
    }

    /// Approximate memory footprint of the stored elements
    pub fn size_bytes(&self) -> usize {
        match &self.layout {
            EntryLayout::Values(index) => index.num_elements() * VALUE_ELEMENT_BYTES,
            EntryLayout::Located(index) => index.num_elements() * LOCATED_ELEMENT_BYTES,
        }
    }

    /// Snapshot for scheduling and diagnostics
    pub fn info(&self) -> CachedDataInfo {
        CachedDataInfo {
            signal: self.signal.clone(),
            bucket_width: self.width_secs,
            num_elements: self.num_elements(),
            has_location: self.has_location(),
            last_update: self.last_update,
            last_packet_timestamp: self.last_packet,
            hits: self.hits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::aggregate_mean_null_location;
    use crate::types::{DataSource, Location};

    fn plain() -> Signal {
        Signal::new(DataSource::new("gsn", "station"), "temp", "timed")
    }

    fn one_hertz(start: i64, secs: i64) -> Vec<TimedLocationValue> {
        (0..secs)
            .map(|i| TimedLocationValue::new(start + i * 1000, (i % 7) as f64))
            .collect()
    }

    #[test]
    fn test_round_trip_matches_direct_aggregation() {
        let policy = StoragePolicy::default();
        let raw = one_hertz(1_000_000, 900);
        let entry = IndexedEntry::from_samples(plain(), 240, &raw, &policy).unwrap();

        let read = entry.read(None, None);
        let expected = aggregate_mean_null_location(&raw, 240);
        assert_eq!(read.len(), expected.len());
        for (a, b) in read.iter().zip(&expected) {
            assert_eq!(a.timestamp, b.timestamp);
            assert!((a.value - b.value).abs() < 1e-9);
        }
        assert_eq!(entry.first_packet_timestamp(), Some(1_000_000));
        assert_eq!(entry.last_packet_timestamp(), Some(1_000_000 + 899_000));
        assert!(entry.last_update().is_some());
    }

    #[test]
    fn test_update_twice_is_idempotent() {
        let policy = StoragePolicy::default();
        let raw = one_hertz(0, 600);
        let mut entry = IndexedEntry::from_samples(plain(), 60, &raw, &policy).unwrap();
        let once = entry.read(None, None);
        entry.update_values(&raw, &policy);
        assert_eq!(entry.read(None, None), once);
        assert_eq!(entry.num_elements(), 10);
    }

    #[test]
    fn test_read_clamps_filters() {
        let policy = StoragePolicy::default();
        let raw = one_hertz(0, 600);
        let entry = IndexedEntry::from_samples(plain(), 60, &raw, &policy).unwrap();
        assert_eq!(entry.start_time(), 0);
        assert_eq!(entry.end_time(), Some(540_000));

        let window = entry.read(Some(-5_000_000), Some(120_000));
        assert_eq!(window.len(), 3);
        assert!(entry.read(Some(10_000_000), None).is_empty());
    }

    #[test]
    fn test_located_layout() {
        let signal = plain().with_location("lat", "lng");
        let loc = Location::new(46.5, 6.6);
        let raw: Vec<_> = (0..10)
            .map(|i| TimedLocationValue::with_location(i * 1000, 2.0, loc))
            .collect();
        let entry =
            IndexedEntry::from_samples(signal, 60, &raw, &StoragePolicy::default()).unwrap();
        assert!(entry.has_location());
        assert_eq!(entry.read(None, None), vec![TimedLocationValue::with_location(0, 2.0, loc)]);
        assert_eq!(entry.size_bytes(), LOCATED_ELEMENT_BYTES);
    }

    #[test]
    fn test_empty_batch_creates_nothing() {
        assert!(IndexedEntry::from_samples(plain(), 60, &[], &StoragePolicy::default()).is_none());
    }
}
