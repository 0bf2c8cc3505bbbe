//! Value-only indexed store
//!
//! A dense array with one slot per bucket, addressed by
//! `(timestamp - anchor) / width`. Empty slots are `None`. The array only
//! grows; each growth reserves a policy-defined headroom of buckets so that
//! steady appends rarely reallocate.

use crate::aggregation::width_millis;
use crate::storage::StoragePolicy;
use crate::types::TimedValue;

/// Dense bucket array for one signal at one bucket width
#[derive(Debug, Clone)]
pub struct ValueIndex {
    anchor: i64,
    width_secs: u32,
    values: Vec<Option<f64>>,
    max_idx: Option<usize>,
    filled: usize,
}

impl ValueIndex {
    /// Create an index anchored at `anchor` (a bucket start) with room for
    /// `capacity` buckets
    pub fn new(anchor: i64, width_secs: u32, capacity: usize) -> Self {
        Self {
            anchor,
            width_secs,
            values: vec![None; capacity],
            max_idx: None,
            filled: 0,
        }
    }

    /// Bucket index for a timestamp, `None` if it lies before the anchor
    pub fn index_of(&self, timestamp: i64) -> Option<usize> {
        if timestamp < self.anchor {
            return None;
        }
        Some(((timestamp - self.anchor) / width_millis(self.width_secs)) as usize)
    }

    /// Write already-aggregated bucket values, overwriting existing slots
    ///
    /// Returns the number of values written. Values before the anchor are
    /// dropped.
    pub fn write(&mut self, aggregated: &[TimedValue], policy: &StoragePolicy) -> usize {
        let mut written = 0;
        for value in aggregated {
            let Some(idx) = self.index_of(value.timestamp) else {
                tracing::warn!(
                    timestamp = value.timestamp,
                    anchor = self.anchor,
                    "Dropping bucket before index anchor"
                );
                continue;
            };
            if idx >= self.values.len() {
                let new_len = idx + 1 + policy.headroom_buckets(self.width_secs);
                self.values.resize(new_len, None);
            }
            if self.values[idx].is_none() {
                self.filled += 1;
            }
            self.values[idx] = Some(value.value);
            self.max_idx = Some(self.max_idx.map_or(idx, |m| m.max(idx)));
            written += 1;
        }
        written
    }

    /// Read buckets whose start lies in `[start, end]`
    pub fn read(&self, start: i64, end: i64) -> Vec<TimedValue> {
        let Some(max_idx) = self.max_idx else {
            return Vec::new();
        };
        if end < start || end < self.anchor {
            return Vec::new();
        }
        let first = self.index_of(start).unwrap_or(0);
        let last = self.index_of(end).unwrap_or(0).min(max_idx);
        let width = width_millis(self.width_secs);

        (first..=last)
            .filter_map(|idx| {
                self.values
                    .get(idx)
                    .copied()
                    .flatten()
                    .map(|v| TimedValue::new(self.anchor + idx as i64 * width, v))
            })
            .collect()
    }

    /// Start of the first bucket
    pub fn start_time(&self) -> i64 {
        self.anchor
    }

    /// Start of the last written bucket
    pub fn end_time(&self) -> Option<i64> {
        self.max_idx
            .map(|idx| self.anchor + idx as i64 * width_millis(self.width_secs))
    }

    /// Number of buckets holding a value
    pub fn num_elements(&self) -> usize {
        self.filled
    }

    /// Allocated bucket slots
    pub fn capacity(&self) -> usize {
        self.values.len()
    }
}
