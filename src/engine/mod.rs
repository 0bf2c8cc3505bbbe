//! Engine facade
//!
//! [`Engine`] is the read API handed to the serving layer: cached reads at a
//! requested bucket width, level-of-detail decisions, signal validation and
//! diagnostics. It also owns the refresh worker pool.
//!
//! # Example
//!
//! ```rust,ignore
//! use lod_cache::engine::EngineBuilder;
//!
//! let engine = EngineBuilder::new()
//!     .with_config(EngineConfig::load(path)?)
//!     .with_reader("gsn", Arc::new(GsnReader::new(client)))
//!     .build()?;
//! engine.start_workers();
//!
//! let width = engine.window_length(&signal, start, end, 1000)?;
//! let data = engine.get_signal_data(&signal, width, start, end, false)?;
//!
//! engine.shutdown().await;
//! ```

pub mod builder;

pub use builder::EngineBuilder;

use std::sync::Arc;

use crate::cache::{CacheManager, TierStats};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::observability::{PrometheusConfig, PrometheusExporter};
use crate::reader::{validate_signal, ReaderRegistry};
use crate::services::WorkerPool;
use crate::types::{CachedDataInfo, InfoSortKey, Signal, TimedLocationValue};

/// Running cache engine
pub struct Engine {
    manager: Arc<CacheManager>,
    readers: ReaderRegistry,
    workers: WorkerPool,
    metrics: PrometheusConfig,
    config: EngineConfig,
}

impl Engine {
    /// Read `signal` aggregated at `width_secs`
    ///
    /// Fails with `UnknownSignal` while the signal is not cached yet.
    pub fn get_signal_data(
        &self,
        signal: &Signal,
        width_secs: u32,
        start: Option<i64>,
        end: Option<i64>,
        ignore_location: bool,
    ) -> Result<Vec<TimedLocationValue>> {
        self.manager
            .get_signal_data(signal, width_secs, start, end, ignore_location)
    }

    /// Whether raw samples in `[start, end]` fit into `max_points`
    pub fn can_serve_unaggregated(
        &self,
        signal: &Signal,
        start: Option<i64>,
        end: Option<i64>,
        max_points: usize,
    ) -> Result<bool> {
        let span = self.manager.sample_span(signal);
        self.manager
            .lookup()
            .can_serve_unaggregated(signal, start, end, max_points, span)
    }

    /// Bucket width keeping `[start, end]` under `max_points` buckets
    pub fn window_length(
        &self,
        signal: &Signal,
        start: Option<i64>,
        end: Option<i64>,
        max_points: usize,
    ) -> Result<u32> {
        let span = self.manager.sample_span(signal);
        self.manager
            .lookup()
            .window_length(signal, start, end, max_points, span)
    }

    /// Whether `signal` has data, registering it for refresh if unseen
    pub fn is_in_cache(&self, signal: &Signal) -> Result<bool> {
        self.manager.is_in_cache(signal)
    }

    /// Oldest raw sample of `signal`
    pub fn first_packet_timestamp(&self, signal: &Signal) -> Option<i64> {
        self.manager.first_packet_timestamp(signal)
    }

    /// Newest raw sample of `signal`
    pub fn last_packet_timestamp(&self, signal: &Signal) -> Option<i64> {
        self.manager.last_packet_timestamp(signal)
    }

    /// Check a user-supplied signal against the registered readers
    pub fn validate_signal(&self, signal: &Signal) -> Result<()> {
        validate_signal(signal, &self.readers)
    }

    /// Queue `signal` for removal from every tier
    pub fn remove_signal(&self, signal: &Signal) {
        self.manager.schedule_signal_for_removal(signal);
    }

    /// Entry metadata of tier `index`, sorted by `key`
    pub fn cached_data_info(&self, index: usize, key: InfoSortKey) -> Result<Vec<CachedDataInfo>> {
        let mut infos = self.manager.cached_data_info(index)?;
        CachedDataInfo::sort_by_key(&mut infos, key);
        Ok(infos)
    }

    /// Counters of the finest tier
    pub fn stats(&self) -> TierStats {
        self.manager.stats()
    }

    /// Current claim of every refresh worker
    pub fn worker_signals(&self) -> Vec<Option<Signal>> {
        self.workers.scheduler().worker_signals()
    }

    /// Diagnostics in Prometheus text format
    pub fn metrics_text(&self) -> String {
        PrometheusExporter::new(self.metrics.clone(), Arc::clone(&self.manager)).export()
    }

    /// The cache manager
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the refresh workers on the current Tokio runtime
    pub fn start_workers(&self) {
        self.workers.start();
    }

    /// Stop the workers and persist estimator state
    pub async fn shutdown(&self) {
        self.workers.shutdown().await;
        match self.manager.lookup().flush() {
            Ok(written) => tracing::info!(written, "Engine stopped"),
            Err(e) => tracing::error!(error = %e, "Failed to persist rate estimations"),
        }
    }
}
