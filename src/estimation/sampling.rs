//! Monthly sampling-interval estimation for one signal
//!
//! Keeps a running mean of the inter-sample gap per calendar month (UTC),
//! anchored at the month of the first sample seen. Data is assumed to arrive
//! roughly in order and without large gaps.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregation::RunningMean;
use crate::error::{Error, Result};
use crate::types::{now_millis, TimedLocationValue};

/// Months allocated initially and added on growth
pub const MONTHS_PER_GROWTH: usize = 12;

/// Samples a month needs before it contributes to a rate estimate
pub const MIN_SAMPLES_PER_MONTH: u64 = 100;

/// Relative change of a monthly mean that marks the estimate as changed
pub const MIN_RELATIVE_CHANGE: f64 = 0.05;

/// Rate returned when no month qualifies (samples per millisecond)
pub const FALLBACK_SAMPLING_RATE: f64 = 0.1;

fn datetime(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(timestamp)
        .ok_or_else(|| Error::Estimation(format!("timestamp {} out of range", timestamp)))
}

/// Per-signal monthly mean sampling interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRateEstimation {
    /// First millisecond of the anchor month (UTC)
    anchor: i64,
    monthly: Vec<Option<RunningMean>>,
    last_significant_update: i64,
}

impl SamplingRateEstimation {
    /// Create an estimator anchored at the calendar month of `first_timestamp`
    pub fn new(first_timestamp: i64) -> Result<Self> {
        let dt = datetime(first_timestamp)?;
        let anchor = Utc
            .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
            .single()
            .ok_or_else(|| Error::Estimation("invalid anchor month".to_string()))?
            .timestamp_millis();
        Ok(Self {
            anchor,
            monthly: vec![None; MONTHS_PER_GROWTH],
            last_significant_update: 0,
        })
    }

    /// Start of the anchor month
    pub fn anchor(&self) -> i64 {
        self.anchor
    }

    /// Last time an update created a month or moved its mean noticeably
    pub fn last_significant_update(&self) -> i64 {
        self.last_significant_update
    }

    /// Number of allocated months
    pub fn months(&self) -> usize {
        self.monthly.len()
    }

    /// Calendar months between the anchor month and `timestamp`
    pub fn month_index(&self, timestamp: i64) -> Result<usize> {
        let anchor = datetime(self.anchor)?;
        let dt = datetime(timestamp)?;
        let diff = (dt.year() - anchor.year()) * 12 + dt.month() as i32 - anchor.month() as i32;
        usize::try_from(diff).map_err(|_| {
            Error::Estimation(format!(
                "timestamp {} lies before estimator anchor {}",
                timestamp, self.anchor
            ))
        })
    }

    fn add_interval(&mut self, month: usize, interval_ms: f64) {
        if month >= self.monthly.len() {
            self.monthly.resize(month + MONTHS_PER_GROWTH, None);
        }
        if self.monthly[month].is_none() {
            self.last_significant_update = now_millis();
        }
        let mean = self.monthly[month].get_or_insert_with(RunningMean::new);

        let old = mean.mean();
        let had_samples = !mean.is_empty();
        mean.push(interval_ms);
        if had_samples && mean.count() > 1 && ((mean.mean() / old) - 1.0).abs() >= MIN_RELATIVE_CHANGE {
            self.last_significant_update = now_millis();
        }
    }

    /// Feed a time-ordered batch of raw samples
    ///
    /// The first sample of the batch overlaps the previous fetch, so gaps are
    /// taken from the second sample onwards. Samples before the anchor stop
    /// the update with an error; gaps already added are kept.
    pub fn update_estimation(&mut self, samples: &[TimedLocationValue]) -> Result<()> {
        if samples.len() < 2 {
            return Ok(());
        }
        for pair in samples[1..].windows(2) {
            let month = self.month_index(pair[1].timestamp)?;
            self.add_interval(month, (pair[1].timestamp - pair[0].timestamp) as f64);
        }
        Ok(())
    }

    /// Estimated samples per millisecond between `start` and `end`
    ///
    /// Averages `1 / mean_interval` over months with at least
    /// [`MIN_SAMPLES_PER_MONTH`] gaps; returns [`FALLBACK_SAMPLING_RATE`] if
    /// none qualifies.
    pub fn sampling_rate(&self, start: i64, end: i64) -> Result<f64> {
        let first = self.month_index(start.max(self.anchor))?;
        let last = self.month_index(end.max(self.anchor))?;

        let rates: Vec<f64> = (first..=last)
            .filter_map(|i| self.monthly.get(i).copied().flatten())
            .filter(|m| m.count() >= MIN_SAMPLES_PER_MONTH && m.mean() > 0.0)
            .map(|m| 1.0 / m.mean())
            .collect();

        if rates.is_empty() {
            return Ok(FALLBACK_SAMPLING_RATE);
        }
        Ok(rates.iter().sum::<f64>() / rates.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15T12:00:00Z
    const MID_MARCH: i64 = 1_710_504_000_000;
    // 2024-03-01T00:00:00Z
    const MARCH_START: i64 = 1_709_251_200_000;

    fn every(start: i64, gap: i64, n: usize) -> Vec<TimedLocationValue> {
        (0..n as i64)
            .map(|i| TimedLocationValue::new(start + i * gap, 1.0))
            .collect()
    }

    #[test]
    fn test_anchor_is_month_start() {
        let e = SamplingRateEstimation::new(MID_MARCH).unwrap();
        assert_eq!(e.anchor(), MARCH_START);
        assert_eq!(e.month_index(MID_MARCH).unwrap(), 0);
        // 2025-01-10
        assert_eq!(e.month_index(1_736_467_200_000).unwrap(), 10);
        assert!(e.month_index(MARCH_START - 1).is_err());
    }

    #[test]
    fn test_rate_after_enough_samples() {
        let mut e = SamplingRateEstimation::new(MID_MARCH).unwrap();
        e.update_estimation(&every(MID_MARCH, 1_000, 300)).unwrap();
        let rate = e.sampling_rate(MID_MARCH, MID_MARCH + 300_000).unwrap();
        assert!((rate - 0.001).abs() < 1e-12);
        assert!(e.last_significant_update() > 0);
    }

    #[test]
    fn test_fallback_below_minimum() {
        let mut e = SamplingRateEstimation::new(MID_MARCH).unwrap();
        // 50 samples -> 48 gaps, below the threshold
        e.update_estimation(&every(MID_MARCH, 1_000, 50)).unwrap();
        let rate = e.sampling_rate(MID_MARCH, MID_MARCH + 50_000).unwrap();
        assert_eq!(rate, FALLBACK_SAMPLING_RATE);
    }

    #[test]
    fn test_grows_forward() {
        let mut e = SamplingRateEstimation::new(MID_MARCH).unwrap();
        // 2026-03-15, 24 months after the anchor
        let later = 1_773_576_000_000;
        e.update_estimation(&every(later, 60_000, 3)).unwrap();
        assert_eq!(e.months(), 24 + MONTHS_PER_GROWTH);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut e = SamplingRateEstimation::new(MID_MARCH).unwrap();
        e.update_estimation(&every(MID_MARCH, 500, 10)).unwrap();
        let json = serde_json::to_string(&e).unwrap();
        let back: SamplingRateEstimation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
