//! Aggregation Functions and Time Bucketing
//!
//! Bucket-mean aggregation used by the indexed stores and by the cache
//! manager's on-the-fly re-aggregation. Inputs must already be sorted by
//! timestamp: a bucket is flushed the moment a sample falls into a different
//! bucket, so an out-of-order sample would open a second bucket with the same
//! start time.

use crate::types::{Location, TimedLocationValue, TimedValue};
use serde::{Deserialize, Serialize};

// =============================================================================
// Running Mean
// =============================================================================

/// Incremental arithmetic mean (Welford update)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    mean: f64,
    count: u64,
}

impl RunningMean {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one value
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
    }

    /// Current mean, 0.0 when empty
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Number of values added
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether no value has been added yet
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// =============================================================================
// Time Bucketing
// =============================================================================

/// Bucket width in milliseconds
#[inline]
pub fn width_millis(width_secs: u32) -> i64 {
    i64::from(width_secs) * 1000
}

/// Truncate a unix-ms timestamp to the start of its `width_secs` bucket
///
/// Uses floor division so timestamps before the epoch land in the bucket
/// that contains them.
#[inline]
pub fn truncate_timestamp(timestamp: i64, width_secs: u32) -> i64 {
    let w = width_millis(width_secs).max(1);
    timestamp.div_euclid(w) * w
}

/// Round a location to `decimals` decimal places
pub fn round_location(location: Location, decimals: u32) -> Location {
    let factor = 10f64.powi(decimals as i32);
    Location {
        latitude: (location.latitude * factor).round() / factor,
        longitude: (location.longitude * factor).round() / factor,
    }
}

/// Aggregate time-ordered samples into one mean per bucket
///
/// # Arguments
/// * `samples` - Samples sorted by ascending timestamp
/// * `width_secs` - Bucket width in seconds
///
/// # Returns
/// One value per non-empty bucket, stamped with the bucket start
pub fn aggregate_mean(samples: &[TimedLocationValue], width_secs: u32) -> Vec<TimedValue> {
    let mut out = Vec::new();
    let mut open: Option<(i64, RunningMean)> = None;

    for sample in samples {
        let bucket = truncate_timestamp(sample.timestamp, width_secs);
        match open.as_mut() {
            Some((start, mean)) if *start == bucket => mean.push(sample.value),
            _ => {
                if let Some((start, mean)) = open.take() {
                    out.push(TimedValue::new(start, mean.mean()));
                }
                let mut mean = RunningMean::new();
                mean.push(sample.value);
                open = Some((bucket, mean));
            }
        }
    }

    if let Some((start, mean)) = open {
        out.push(TimedValue::new(start, mean.mean()));
    }
    out
}

/// Like [`aggregate_mean`], but yields location-less located values
pub fn aggregate_mean_null_location(
    samples: &[TimedLocationValue],
    width_secs: u32,
) -> Vec<TimedLocationValue> {
    aggregate_mean(samples, width_secs)
        .into_iter()
        .map(TimedLocationValue::from)
        .collect()
}

/// Aggregate time-ordered samples into one mean per (bucket, rounded location)
///
/// Within a bucket, groups are emitted in order of first appearance. Samples
/// without a location form their own group.
pub fn aggregate_mean_with_location(
    samples: &[TimedLocationValue],
    width_secs: u32,
    location_decimals: u32,
) -> Vec<TimedLocationValue> {
    let mut out = Vec::new();
    let mut open_bucket: Option<i64> = None;
    let mut groups: Vec<(Option<Location>, RunningMean)> = Vec::new();

    for sample in samples {
        let bucket = truncate_timestamp(sample.timestamp, width_secs);
        if open_bucket != Some(bucket) {
            if let Some(start) = open_bucket {
                flush_groups(start, &mut groups, &mut out);
            }
            open_bucket = Some(bucket);
        }

        let location = sample.location.map(|l| round_location(l, location_decimals));
        match groups.iter_mut().find(|(l, _)| *l == location) {
            Some((_, mean)) => mean.push(sample.value),
            None => {
                let mut mean = RunningMean::new();
                mean.push(sample.value);
                groups.push((location, mean));
            }
        }
    }

    if let Some(start) = open_bucket {
        flush_groups(start, &mut groups, &mut out);
    }
    out
}

fn flush_groups(
    start: i64,
    groups: &mut Vec<(Option<Location>, RunningMean)>,
    out: &mut Vec<TimedLocationValue>,
) {
    for (location, mean) in groups.drain(..) {
        out.push(TimedLocationValue {
            timestamp: start,
            value: mean.mean(),
            location,
        });
    }
}
