//! Level-of-detail decisions
//!
//! Decides whether a request can be answered with raw samples and, if not,
//! which bucket width keeps the response under the requested point count.
//! Owns the per-signal [`SamplingRateEstimation`] map and its optional
//! durable store; `load` and `flush` are called explicitly by the engine at
//! start and shutdown.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::estimation::{EstimationStore, SamplingRateEstimation};
use crate::types::{now_millis, Signal, TimedLocationValue};

/// Smallest bucket width handed out, in seconds
pub const MIN_WINDOW_LENGTH_SECS: u32 = 240;

/// Known raw-sample span of a signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleSpan {
    /// Oldest raw sample timestamp
    pub first: Option<i64>,
    /// Newest raw sample timestamp
    pub last: Option<i64>,
}

#[derive(Debug, Default)]
struct PersistState {
    last_write: Option<i64>,
    stored: HashSet<Signal>,
}

/// Per-signal sampling-rate model and level-of-detail lookup
pub struct DetailLevelLookup {
    estimators: RwLock<HashMap<Signal, SamplingRateEstimation>>,
    store: Option<EstimationStore>,
    persist: Mutex<PersistState>,
    persist_interval_ms: i64,
}

impl DetailLevelLookup {
    /// Create a lookup without durable persistence
    pub fn new() -> Self {
        Self {
            estimators: RwLock::new(HashMap::new()),
            store: None,
            persist: Mutex::new(PersistState::default()),
            persist_interval_ms: 0,
        }
    }

    /// Create a lookup persisting into `store` at most every
    /// `persist_interval_secs`
    pub fn with_store(store: EstimationStore, persist_interval_secs: u64) -> Self {
        Self {
            store: Some(store),
            persist_interval_ms: (persist_interval_secs as i64).saturating_mul(1000),
            ..Self::new()
        }
    }

    /// Restore estimators from the durable store
    pub fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_all()?;
        let count = loaded.len();
        let mut estimators = self.estimators.write();
        let mut persist = self.persist.lock();
        for (signal, estimation) in loaded {
            persist.stored.insert(signal.clone());
            estimators.insert(signal, estimation);
        }
        tracing::info!(estimators = count, "Loaded sampling rate estimations");
        Ok(count)
    }

    /// Write every new or changed estimator, ignoring the throttle
    pub fn flush(&self) -> Result<usize> {
        self.persist(true)
    }

    fn persist(&self, force: bool) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut persist = self.persist.lock();
        let now = now_millis();
        if !force {
            if let Some(last) = persist.last_write {
                if now - last < self.persist_interval_ms {
                    return Ok(0);
                }
            }
        }

        let last_write = persist.last_write.unwrap_or(i64::MIN);
        let dirty: Vec<(Signal, SamplingRateEstimation)> = self
            .estimators
            .read()
            .iter()
            .filter(|(signal, e)| {
                !persist.stored.contains(*signal) || e.last_significant_update() > last_write
            })
            .map(|(s, e)| (s.clone(), e.clone()))
            .collect();

        let written = store.upsert(&dirty)?;
        persist.stored.extend(dirty.into_iter().map(|(s, _)| s));
        persist.last_write = Some(now);
        if written > 0 {
            tracing::debug!(written, "Persisted sampling rate estimations");
        }
        Ok(written)
    }

    /// Whether an estimator exists for `signal`
    pub fn has_estimation(&self, signal: &Signal) -> bool {
        self.estimators.read().contains_key(signal)
    }

    /// Copy of the estimator of `signal`
    pub fn estimation(&self, signal: &Signal) -> Option<SamplingRateEstimation> {
        self.estimators.read().get(signal).cloned()
    }

    /// Number of signals with an estimator
    pub fn len(&self) -> usize {
        self.estimators.read().len()
    }

    /// Whether no estimator exists
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether raw samples for `[start, end]` fit into `max_points`
    ///
    /// Without an estimator the answer is `false`. A window entirely outside
    /// the known span is trivially `true`.
    pub fn can_serve_unaggregated(
        &self,
        signal: &Signal,
        start: Option<i64>,
        end: Option<i64>,
        max_points: usize,
        span: SampleSpan,
    ) -> Result<bool> {
        let estimators = self.estimators.read();
        let Some(estimation) = estimators.get(signal) else {
            return Ok(false);
        };
        let (Some(first), Some(last)) = (span.first, span.last) else {
            return Ok(false);
        };

        if start.is_some_and(|s| s > last) || end.is_some_and(|e| e < first) {
            return Ok(true);
        }
        let start = start.map_or(first, |s| s.max(first));
        let end = end.map_or(last, |e| e.min(last));

        let duration = end.saturating_sub(start).max(0) as f64;
        let points = duration * estimation.sampling_rate(start, end)?;
        Ok(points < max_points as f64)
    }

    /// Smallest multiple of [`MIN_WINDOW_LENGTH_SECS`] that yields at most
    /// `max_points` buckets over the clamped range
    ///
    /// # Errors
    /// * `UnresolvedTimeRange` if a bound is open and the span is unknown
    /// * `InvalidArgument` if `max_points` is zero
    pub fn window_length(
        &self,
        signal: &Signal,
        start: Option<i64>,
        end: Option<i64>,
        max_points: usize,
        span: SampleSpan,
    ) -> Result<u32> {
        if max_points == 0 {
            return Err(Error::InvalidArgument("max_points must be positive".to_string()));
        }
        let start = clamp_bound(start, span.first, i64::max).ok_or_else(|| {
            Error::UnresolvedTimeRange(format!("no start time for {}", signal.unique_key()))
        })?;
        let end = clamp_bound(end, span.last, i64::min).ok_or_else(|| {
            Error::UnresolvedTimeRange(format!("no end time for {}", signal.unique_key()))
        })?;

        let duration = i128::from(end.saturating_sub(start).max(0));
        let per_window = i128::from(MIN_WINDOW_LENGTH_SECS) * 1000 * max_points as i128;
        let multiple = ((duration + per_window - 1) / per_window).max(1);
        u32::try_from(multiple * i128::from(MIN_WINDOW_LENGTH_SECS)).map_err(|_| {
            Error::InvalidArgument(format!("time range of {} ms too large", duration))
        })
    }

    /// Feed freshly fetched raw samples into the signal's estimator
    ///
    /// Creates the estimator on first use and persists if the throttle allows.
    pub fn update_sampling_rate_estimation(
        &self,
        signal: &Signal,
        samples: &[TimedLocationValue],
    ) -> Result<()> {
        let Some(first) = samples.first() else {
            return Ok(());
        };
        {
            let mut estimators = self.estimators.write();
            if !estimators.contains_key(signal) {
                estimators.insert(signal.clone(), SamplingRateEstimation::new(first.timestamp)?);
            }
            if let Some(estimation) = estimators.get_mut(signal) {
                estimation.update_estimation(samples)?;
            }
        }
        self.persist(false)?;
        Ok(())
    }

    /// Drop the estimator of `signal`, also from the durable store
    pub fn delete_signal_estimation(&self, signal: &Signal) -> Result<()> {
        self.estimators.write().remove(signal);
        self.persist.lock().stored.remove(signal);
        if let Some(store) = &self.store {
            store.delete(signal)?;
        }
        Ok(())
    }
}

impl Default for DetailLevelLookup {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_bound(requested: Option<i64>, known: Option<i64>, pick: fn(i64, i64) -> i64) -> Option<i64> {
    match (requested, known) {
        (Some(r), Some(k)) => Some(pick(r, k)),
        (None, Some(k)) => Some(k),
        (Some(r), None) => Some(r),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataSource;
    use proptest::prelude::*;

    const HOUR: i64 = 3_600_000;
    // 2024-03-15T12:00:00Z
    const T0: i64 = 1_710_504_000_000;

    fn signal() -> Signal {
        Signal::new(DataSource::new("gsn", "station"), "temp", "timed")
    }

    fn every_minute(n: i64) -> Vec<TimedLocationValue> {
        (0..n).map(|i| TimedLocationValue::new(T0 + i * 60_000, 1.0)).collect()
    }

    #[test]
    fn test_no_estimator_forces_aggregation() {
        let lookup = DetailLevelLookup::new();
        let span = SampleSpan { first: Some(T0), last: Some(T0 + HOUR) };
        assert!(!lookup.can_serve_unaggregated(&signal(), None, None, 100, span).unwrap());
    }

    #[test]
    fn test_four_hour_scenario() {
        let lookup = DetailLevelLookup::new();
        // one sample per minute for a day: rate 1/60000 per ms
        lookup
            .update_sampling_rate_estimation(&signal(), &every_minute(1_440))
            .unwrap();
        let span = SampleSpan { first: Some(T0), last: Some(T0 + 24 * HOUR) };

        // 4 hours at 1/min = 240 points
        let four_hours = (Some(T0), Some(T0 + 4 * HOUR));
        assert!(!lookup
            .can_serve_unaggregated(&signal(), four_hours.0, four_hours.1, 100, span)
            .unwrap());
        assert!(lookup
            .can_serve_unaggregated(&signal(), four_hours.0, four_hours.1, 300, span)
            .unwrap());

        // outside the known span nothing is fetched anyway
        assert!(lookup
            .can_serve_unaggregated(&signal(), Some(T0 + 48 * HOUR), None, 1, span)
            .unwrap());
    }

    #[test]
    fn test_window_length() {
        let lookup = DetailLevelLookup::new();
        let span = SampleSpan { first: Some(0), last: Some(4 * HOUR) };
        // 4h / 100 points = 144 s -> minimum width
        assert_eq!(lookup.window_length(&signal(), None, None, 100, span).unwrap(), 240);
        // 4h / 10 points = 1440 s = 6 * 240
        assert_eq!(lookup.window_length(&signal(), None, None, 10, span).unwrap(), 1_440);
        // 4h / 7 points = 2057 s -> 9 * 240
        assert_eq!(lookup.window_length(&signal(), None, None, 7, span).unwrap(), 2_160);
    }

    #[test]
    fn test_extreme_span_does_not_overflow() {
        let lookup = DetailLevelLookup::new();
        lookup
            .update_sampling_rate_estimation(&signal(), &every_minute(10))
            .unwrap();
        let span = SampleSpan { first: Some(i64::MIN), last: Some(i64::MAX) };
        assert!(matches!(
            lookup.window_length(&signal(), None, None, 1, span),
            Err(Error::InvalidArgument(_))
        ));
        // ten years still fits a width
        let decade = SampleSpan { first: Some(0), last: Some(87_600 * HOUR) };
        assert_eq!(lookup.window_length(&signal(), None, None, 1, decade).unwrap() % 240, 0);
        // timestamps beyond the calendar range fail cleanly
        assert!(lookup
            .can_serve_unaggregated(&signal(), None, None, 10, span)
            .is_err());
    }

    #[test]
    fn test_window_length_unresolved() {
        let lookup = DetailLevelLookup::new();
        let err = lookup
            .window_length(&signal(), None, Some(HOUR), 10, SampleSpan::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedTimeRange(_)));
        assert!(matches!(
            lookup.window_length(&signal(), Some(0), Some(HOUR), 0, SampleSpan::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_persistence_lifecycle() {
        let store = EstimationStore::open_in_memory().unwrap();
        let lookup = DetailLevelLookup::with_store(store, 3_600);
        lookup
            .update_sampling_rate_estimation(&signal(), &every_minute(10))
            .unwrap();
        // first update writes immediately, later ones are throttled until flush
        assert_eq!(lookup.flush().unwrap(), 0);

        lookup.delete_signal_estimation(&signal()).unwrap();
        assert!(!lookup.has_estimation(&signal()));
        assert_eq!(lookup.load().unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_window_length_grows_as_points_shrink(
            duration in 0i64..10_000_000_000,
            points in 2usize..5_000,
        ) {
            let lookup = DetailLevelLookup::new();
            let span = SampleSpan { first: Some(0), last: Some(duration) };
            let wide = lookup.window_length(&signal(), None, None, points, span).unwrap();
            let narrow = lookup.window_length(&signal(), None, None, points - 1, span).unwrap();
            prop_assert!(narrow >= wide);
            prop_assert!(wide % MIN_WINDOW_LENGTH_SECS == 0);
            prop_assert!(duration as f64 / (f64::from(wide) * 1000.0) <= points as f64);
        }
    }
}
