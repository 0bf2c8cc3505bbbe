//! End-to-end tests: refresh from a scripted reader, tiered reads,
//! level-of-detail decisions, removal and persistence across restarts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use lod_cache::cache::RefreshOutcome;
use lod_cache::types::InfoSortKey;
use lod_cache::{
    DataReader, DataSource, Engine, EngineBuilder, EngineConfig, Error, ReaderError, Signal,
    TierSpec, TimedLocationValue,
};

/// 2024-03-15T12:00:00Z
const T0: i64 = 1_710_504_000_000;

/// Reader serving an in-memory series that tests can extend
struct ScriptedReader {
    samples: Mutex<Vec<TimedLocationValue>>,
    fetches: AtomicUsize,
}

impl ScriptedReader {
    fn new(samples: Vec<TimedLocationValue>) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(samples),
            fetches: AtomicUsize::new(0),
        })
    }

    fn extend(&self, more: Vec<TimedLocationValue>) {
        self.samples.lock().extend(more);
    }
}

#[async_trait]
impl DataReader for ScriptedReader {
    fn validate(&self, signal: &Signal) -> Result<(), ReaderError> {
        if signal.time_field != "timed" {
            return Err(ReaderError::InvalidSignal("unknown time field".to_string()));
        }
        Ok(())
    }

    async fn fetch(
        &self,
        _signal: &Signal,
        start: Option<i64>,
        end: Option<i64>,
        row_limit: usize,
    ) -> Result<Vec<TimedLocationValue>, ReaderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let samples = self.samples.lock();
        let selected = samples
            .iter()
            .filter(|s| start.map_or(true, |t| s.timestamp >= t))
            .filter(|s| end.map_or(true, |t| s.timestamp <= t))
            .copied();
        Ok(if row_limit == 0 {
            selected.collect()
        } else {
            selected.take(row_limit).collect()
        })
    }
}

fn one_hertz(from_secs: i64, to_secs: i64) -> Vec<TimedLocationValue> {
    (from_secs..to_secs)
        .map(|i| TimedLocationValue::new(T0 + i * 1000, (i % 60) as f64))
        .collect()
}

fn signal() -> Signal {
    Signal::new(DataSource::new("gsn", "station_a"), "temperature", "timed")
}

fn memory_config() -> EngineConfig {
    EngineConfig {
        tiers: vec![TierSpec::memory(3_600), TierSpec::memory(240)],
        refresh_min_age_secs: 0,
        update_interval_ms: 10,
        ..Default::default()
    }
}

fn build(config: EngineConfig, reader: Arc<ScriptedReader>) -> Engine {
    EngineBuilder::new()
        .with_config(config)
        .with_reader("gsn", reader)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_refresh_then_read_at_each_width() {
    let reader = ScriptedReader::new(one_hertz(0, 7_200));
    let engine = build(memory_config(), reader.clone());
    let s = signal();

    assert!(!engine.is_in_cache(&s).unwrap());
    assert!(matches!(
        engine.get_signal_data(&s, 240, None, None, true),
        Err(Error::UnknownSignal(_))
    ));

    let outcome = engine.manager().update_cached_signal(&s).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Updated { samples: 7_200 });
    assert!(engine.is_in_cache(&s).unwrap());
    assert_eq!(engine.first_packet_timestamp(&s), Some(T0));
    assert_eq!(engine.last_packet_timestamp(&s), Some(T0 + 7_199_000));

    let fine = engine.get_signal_data(&s, 240, None, None, false).unwrap();
    assert_eq!(fine.len(), 30);
    assert!((fine[0].value - 29.5).abs() < 1e-9);

    let hourly = engine.get_signal_data(&s, 3_600, None, None, false).unwrap();
    assert_eq!(hourly.len(), 2);
    assert_eq!(hourly[1].timestamp, T0 + 3_600_000);

    // served from the 240 s tier, re-aggregated on the fly
    let twenty_minutes = engine.get_signal_data(&s, 1_200, None, None, true).unwrap();
    assert_eq!(twenty_minutes.len(), 6);

    let bounded = engine
        .get_signal_data(&s, 240, Some(T0 + 480_000), Some(T0 + 960_000), false)
        .unwrap();
    assert_eq!(bounded.len(), 3);
    assert_eq!(bounded[0].timestamp, T0 + 480_000);

    let stats = engine.stats();
    assert!(stats.hits >= 1);
    assert_eq!(reader.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_level_of_detail_decisions() {
    let reader = ScriptedReader::new(one_hertz(0, 7_200));
    let engine = build(memory_config(), reader);
    let s = signal();

    assert!(matches!(
        engine.window_length(&s, None, None, 100),
        Err(Error::UnresolvedTimeRange(_))
    ));
    assert!(!engine.can_serve_unaggregated(&s, None, None, 10_000).unwrap());

    engine.manager().update_cached_signal(&s).await.unwrap();

    assert_eq!(engine.window_length(&s, None, None, 100).unwrap(), 240);
    assert_eq!(engine.window_length(&s, None, None, 10).unwrap(), 720);
    // about 7 200 raw samples in the span
    assert!(engine.can_serve_unaggregated(&s, None, None, 10_000).unwrap());
    assert!(!engine.can_serve_unaggregated(&s, None, None, 1_000).unwrap());
    // window after the last sample
    assert!(engine
        .can_serve_unaggregated(&s, Some(T0 + 10_000_000), None, 1)
        .unwrap());
}

#[tokio::test]
async fn test_incremental_refresh_extends_tiers() {
    let reader = ScriptedReader::new(one_hertz(0, 3_600));
    let engine = build(memory_config(), reader.clone());
    let s = signal();

    engine.manager().update_cached_signal(&s).await.unwrap();
    reader.extend(one_hertz(3_600, 7_200));
    engine.manager().update_cached_signal(&s).await.unwrap();

    assert_eq!(engine.last_packet_timestamp(&s), Some(T0 + 7_199_000));
    assert_eq!(engine.get_signal_data(&s, 240, None, None, true).unwrap().len(), 30);
    let hourly = engine.get_signal_data(&s, 3_600, None, None, true).unwrap();
    assert_eq!(hourly.len(), 2);
    assert!((hourly[1].value - 29.5).abs() < 1e-9);

    let infos = engine.cached_data_info(1, InfoSortKey::KeyAscending).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].num_elements, 30);
    assert_eq!(infos[0].bucket_width, 240);
}

#[tokio::test]
async fn test_workers_refresh_and_remove() {
    let reader = ScriptedReader::new(one_hertz(0, 1_200));
    let engine = build(memory_config(), reader);
    let s = signal();

    assert!(!engine.is_in_cache(&s).unwrap());
    engine.start_workers();

    let mut rounds = 0;
    while !engine.is_in_cache(&s).unwrap() && rounds < 500 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        rounds += 1;
    }
    assert!(engine.is_in_cache(&s).unwrap());

    engine.remove_signal(&s);
    let mut rounds = 0;
    while !engine.manager().signals_to_remove().is_empty() && rounds < 500 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        rounds += 1;
    }
    assert!(engine.manager().signals_to_remove().is_empty());
    assert!(matches!(
        engine.get_signal_data(&s, 240, None, None, true),
        Err(Error::UnknownSignal(_))
    ));

    engine.shutdown().await;
    assert_eq!(engine.worker_signals(), vec![None]);
}

#[tokio::test]
async fn test_sql_tier_and_estimator_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        sql_path: Some(dir.path().join("cache.db")),
        tiers: vec![TierSpec::memory(3_600), TierSpec::sql(240)],
        ..memory_config()
    };
    let s = signal();

    {
        let engine = build(config.clone(), ScriptedReader::new(one_hertz(0, 7_200)));
        engine.manager().update_cached_signal(&s).await.unwrap();
        engine.shutdown().await;
    }

    let reader = ScriptedReader::new(Vec::new());
    let engine = build(config, reader.clone());
    assert!(engine.manager().lookup().has_estimation(&s));
    assert!(engine.is_in_cache(&s).unwrap());
    assert_eq!(engine.get_signal_data(&s, 240, None, None, true).unwrap().len(), 30);
    assert_eq!(engine.window_length(&s, None, None, 100).unwrap(), 240);
    // restored bookkeeping knows the signal without fetching
    assert!(engine
        .manager()
        .signals_with_staleness()
        .iter()
        .any(|st| st.signal == s && st.last_attempt > 0));
    assert_eq!(reader.fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn test_validate_signal_and_metrics() {
    let engine = build(memory_config(), ScriptedReader::new(Vec::new()));
    assert!(engine.validate_signal(&signal()).is_ok());

    let mut bad = signal();
    bad.time_field = "other".to_string();
    assert!(matches!(
        engine.validate_signal(&bad),
        Err(Error::Reader(ReaderError::InvalidSignal(_)))
    ));
    let unknown = Signal::new(DataSource::new("csv", "file"), "v", "timed");
    assert!(engine.validate_signal(&unknown).is_err());

    let text = engine.metrics_text();
    assert!(text.contains("lod_cache_tier_entries"));
    assert!(text.contains("width=\"240\""));
}
