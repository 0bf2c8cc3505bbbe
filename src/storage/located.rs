//! Value+location indexed store
//!
//! A time bucket may hold several (value, location) pairs, one per distinct
//! rounded location. The layout keeps flat `values`/`latitudes`/`longitudes`
//! arrays and a translation table mapping each bucket index to a contiguous
//! `[start, end)` run in those arrays:
//!
//! ```text
//! translation:  [ (0,2) | None | (2,3) | (3,5) ]
//!                  │              │       │
//! values:       [ v0 v1 ......... v2 .... v3 v4 ]
//! ```
//!
//! A write truncates every bucket at and after the first bucket of the new
//! batch before appending, so the run for a bucket is always contiguous.
//! Missing locations are stored as NaN coordinates.

use crate::aggregation::width_millis;
use crate::storage::StoragePolicy;
use crate::types::{Location, TimedLocationValue};

/// Bucketed (value, location) runs for one signal at one bucket width
#[derive(Debug, Clone)]
pub struct LocatedIndex {
    anchor: i64,
    width_secs: u32,
    translation: Vec<Option<(usize, usize)>>,
    values: Vec<f64>,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
}

impl LocatedIndex {
    /// Create an index anchored at `anchor` with room for `buckets` buckets and
    /// `elements` flat elements
    pub fn new(anchor: i64, width_secs: u32, buckets: usize, elements: usize) -> Self {
        Self {
            anchor,
            width_secs,
            translation: Vec::with_capacity(buckets),
            values: Vec::with_capacity(elements),
            latitudes: Vec::with_capacity(elements),
            longitudes: Vec::with_capacity(elements),
        }
    }

    fn index_of(&self, timestamp: i64) -> Option<usize> {
        if timestamp < self.anchor {
            return None;
        }
        Some(((timestamp - self.anchor) / width_millis(self.width_secs)) as usize)
    }

    /// Write location-aggregated values sorted by time
    ///
    /// Everything stored at or after the first new bucket is discarded first.
    /// Returns the number of elements appended.
    pub fn write(&mut self, aggregated: &[TimedLocationValue], policy: &StoragePolicy) -> usize {
        let anchor = self.anchor;
        let mut iter = aggregated.iter().skip_while(|v| {
            let before = v.timestamp < anchor;
            if before {
                tracing::warn!(
                    timestamp = v.timestamp,
                    anchor,
                    "Dropping located bucket before index anchor"
                );
            }
            before
        });
        let Some(first) = iter.next() else {
            return 0;
        };
        let first_idx = self.index_of(first.timestamp).unwrap_or(0);
        self.truncate_from(first_idx);

        let headroom = policy.headroom_buckets(self.width_secs);
        let mut appended = 0;
        for value in std::iter::once(first).chain(iter) {
            let Some(idx) = self.index_of(value.timestamp) else {
                continue;
            };
            if idx >= self.translation.len() {
                if idx >= self.translation.capacity() {
                    self.translation
                        .reserve(idx + 1 + headroom - self.translation.len());
                }
                self.translation.resize(idx + 1, None);
            }
            if self.values.len() == self.values.capacity() {
                self.values.reserve(headroom);
                self.latitudes.reserve(headroom);
                self.longitudes.reserve(headroom);
            }

            let pos = self.values.len();
            self.values.push(value.value);
            let (lat, lng) = match value.location {
                Some(l) => (l.latitude, l.longitude),
                None => (f64::NAN, f64::NAN),
            };
            self.latitudes.push(lat);
            self.longitudes.push(lng);

            self.translation[idx] = Some(match self.translation[idx] {
                Some((start, _)) => (start, pos + 1),
                None => (pos, pos + 1),
            });
            appended += 1;
        }
        appended
    }

    fn truncate_from(&mut self, idx: usize) {
        if idx >= self.translation.len() {
            return;
        }
        let flat_start = self.translation[idx..]
            .iter()
            .flatten()
            .map(|(start, _)| *start)
            .next();
        if let Some(start) = flat_start {
            self.values.truncate(start);
            self.latitudes.truncate(start);
            self.longitudes.truncate(start);
        }
        self.translation.truncate(idx);
    }

    fn max_idx(&self) -> Option<usize> {
        self.translation.iter().rposition(Option::is_some)
    }

    /// Read every element whose bucket start lies in `[start, end]`
    pub fn read(&self, start: i64, end: i64) -> Vec<TimedLocationValue> {
        let Some(max_idx) = self.max_idx() else {
            return Vec::new();
        };
        if end < start || end < self.anchor {
            return Vec::new();
        }
        let first = self.index_of(start).unwrap_or(0);
        let last = self.index_of(end).unwrap_or(0).min(max_idx);
        let width = width_millis(self.width_secs);

        let mut out = Vec::new();
        for idx in first..=last {
            let Some((from, to)) = self.translation.get(idx).copied().flatten() else {
                continue;
            };
            let timestamp = self.anchor + idx as i64 * width;
            for pos in from..to {
                let (lat, lng) = (self.latitudes[pos], self.longitudes[pos]);
                let location = if lat.is_nan() || lng.is_nan() {
                    None
                } else {
                    Some(Location::new(lat, lng))
                };
                out.push(TimedLocationValue {
                    timestamp,
                    value: self.values[pos],
                    location,
                });
            }
        }
        out
    }

    /// Start of the first bucket
    pub fn start_time(&self) -> i64 {
        self.anchor
    }

    /// Start of the last written bucket
    pub fn end_time(&self) -> Option<i64> {
        self.max_idx()
            .map(|idx| self.anchor + idx as i64 * width_millis(self.width_secs))
    }

    /// Number of stored (value, location) elements
    pub fn num_elements(&self) -> usize {
        self.values.len()
    }

    /// Number of bucket slots in the translation table
    pub fn bucket_count(&self) -> usize {
        self.translation.len()
    }
}
