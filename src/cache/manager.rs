//! Tiered cache manager
//!
//! Holds the tier configurations ordered by descending bucket width. The
//! last configuration is the finest tier: it is refreshed from the external
//! reader, and every other tier is derived from it by aggregating further.
//!
//! ```text
//!   read(width = 3600) ──▶ [86400] skip ─▶ [3600] hit ─▶ return as is
//!   read(width = 1200) ──▶ [86400] skip ─▶ [3600] skip ─▶ [240] hit ─▶ re-aggregate
//!
//!   refresh:  reader ──▶ [240] ──▶ [3600]
//!                              └─▶ [86400]
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::aggregation::{aggregate_mean_null_location, aggregate_mean_with_location, width_millis};
use crate::cache::tier::{CacheTier, TierStats};
use crate::error::{Error, Result};
use crate::estimation::{DetailLevelLookup, SampleSpan};
use crate::observability::CacheMetrics;
use crate::reader::ReaderRegistry;
use crate::storage::DEFAULT_LOCATION_DECIMALS;
use crate::types::{now_millis, CachedDataInfo, Signal, SignalStaleness, TimedLocationValue};

/// Minimum age of a tier entry before it is refreshed again
pub const DEFAULT_REFRESH_MIN_AGE: Duration = Duration::from_secs(120);

/// One tier and the bucket width it stores
#[derive(Clone)]
pub struct CacheConfiguration {
    /// Tier backend
    pub tier: Arc<dyn CacheTier>,
    /// Bucket width in seconds
    pub width_secs: u32,
}

impl CacheConfiguration {
    /// Pair a tier with its bucket width
    pub fn new(tier: Arc<dyn CacheTier>, width_secs: u32) -> Self {
        Self { tier, width_secs }
    }
}

impl std::fmt::Debug for CacheConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfiguration")
            .field("backend", &self.tier.backend())
            .field("width_secs", &self.width_secs)
            .finish()
    }
}

/// Result of one refresh of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The finest tier was updated recently; only derived tiers were checked
    Fresh,
    /// The reader returned no new samples
    NoNewData,
    /// New samples were written
    Updated {
        /// Raw samples fetched
        samples: usize,
    },
}

impl RefreshOutcome {
    /// Label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Fresh => "fresh",
            RefreshOutcome::NoNewData => "empty",
            RefreshOutcome::Updated { .. } => "updated",
        }
    }
}

/// Routes reads to tiers and drives source→tier and tier→tier refreshes
pub struct CacheManager {
    configs: Vec<CacheConfiguration>,
    readers: ReaderRegistry,
    lookup: Arc<DetailLevelLookup>,
    last_attempt: RwLock<HashMap<Signal, i64>>,
    pending_removal: Mutex<Vec<Signal>>,
    refresh_min_age_ms: i64,
    location_decimals: u32,
    metrics: Option<Arc<CacheMetrics>>,
}

impl CacheManager {
    /// Create a manager over `configs`
    ///
    /// Configurations are sorted by descending width. Known signals of the
    /// finest tier seed the refresh bookkeeping, using their last update
    /// where data exists.
    ///
    /// # Errors
    /// `Configuration` if the list is empty or widths are zero or repeated.
    pub fn new(
        mut configs: Vec<CacheConfiguration>,
        readers: ReaderRegistry,
        lookup: Arc<DetailLevelLookup>,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Configuration("at least one cache tier is required".to_string()));
        }
        configs.sort_by(|a, b| b.width_secs.cmp(&a.width_secs));
        for pair in configs.windows(2) {
            if pair[0].width_secs == pair[1].width_secs {
                return Err(Error::Configuration(format!(
                    "duplicate bucket width {}s",
                    pair[0].width_secs
                )));
            }
        }
        if configs.iter().any(|c| c.width_secs == 0) {
            return Err(Error::Configuration("bucket width must be positive".to_string()));
        }

        let manager = Self {
            configs,
            readers,
            lookup,
            last_attempt: RwLock::new(HashMap::new()),
            pending_removal: Mutex::new(Vec::new()),
            refresh_min_age_ms: DEFAULT_REFRESH_MIN_AGE.as_millis() as i64,
            location_decimals: DEFAULT_LOCATION_DECIMALS,
            metrics: None,
        };
        manager.seed_last_attempts();
        Ok(manager)
    }

    /// Set the minimum entry age before a tier is refreshed again
    pub fn with_refresh_min_age(mut self, age: Duration) -> Self {
        self.refresh_min_age_ms = age.as_millis() as i64;
        self
    }

    /// Set the rounding precision for on-the-fly location grouping
    pub fn with_location_decimals(mut self, decimals: u32) -> Self {
        self.location_decimals = decimals;
        self
    }

    /// Attach counters
    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn seed_last_attempts(&self) {
        let finest = self.finest();
        let mut attempts = self.last_attempt.write();
        for signal in finest.tier.signals() {
            attempts.insert(signal, 0);
        }
        for info in finest.tier.cached_data_info() {
            if info.bucket_width == finest.width_secs {
                attempts.insert(info.signal, info.last_update.unwrap_or(0));
            }
        }
    }

    fn finest(&self) -> &CacheConfiguration {
        // non-empty, checked in new()
        &self.configs[self.configs.len() - 1]
    }

    fn config(&self, index: usize) -> Result<&CacheConfiguration> {
        self.configs.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "tier index {} out of range ({} tiers)",
                index,
                self.configs.len()
            ))
        })
    }

    fn incremental_start(config: &CacheConfiguration, signal: &Signal) -> Option<i64> {
        if !config.tier.is_in_cache(signal, config.width_secs) {
            return None;
        }
        config
            .tier
            .end_time(signal, config.width_secs)
            .map(|end| end - width_millis(config.width_secs))
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Read a signal at `width_secs`
    ///
    /// Uses the coarsest tier whose width does not exceed the requested one.
    /// If that tier's width differs, or location grouping is requested, the
    /// data is re-aggregated to `width_secs` before returning.
    ///
    /// # Errors
    /// `UnknownSignal` if no eligible tier holds the signal.
    pub fn get_signal_data(
        &self,
        signal: &Signal,
        width_secs: u32,
        start: Option<i64>,
        end: Option<i64>,
        ignore_location: bool,
    ) -> Result<Vec<TimedLocationValue>> {
        let started = Instant::now();
        let mut found = None;
        for config in &self.configs {
            if config.width_secs > width_secs {
                continue;
            }
            if let Some(data) =
                config
                    .tier
                    .signal_data(signal, config.width_secs, start, end, true)?
            {
                if let Some(metrics) = &self.metrics {
                    metrics.record_tier_read(config.tier.backend().as_str());
                }
                found = Some((config, data));
                break;
            }
        }

        let Some((config, data)) = found else {
            return Err(Error::UnknownSignal(signal.unique_key()));
        };
        tracing::debug!(
            signal = %signal,
            tier_width = config.width_secs,
            requested_width = width_secs,
            elements = data.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Served cached signal data"
        );

        if data.is_empty() || (!ignore_location && width_secs == config.width_secs) {
            return Ok(data);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_live_aggregation();
        }
        let with_location = !ignore_location && data[0].location.is_some();
        Ok(if with_location {
            aggregate_mean_with_location(&data, width_secs, self.location_decimals)
        } else {
            aggregate_mean_null_location(&data, width_secs)
        })
    }

    // ========================================================================
    // Refresh path
    // ========================================================================

    /// Refresh a signal from its reader and propagate to all tiers
    ///
    /// Tier writes run on Tokio's blocking pool, so a durable tier never
    /// stalls the async workers.
    ///
    /// # Errors
    /// Reader, registry and finest-tier write failures. Derived tiers log
    /// their own failures and are retried on the next refresh.
    pub async fn update_cached_signal(&self, signal: &Signal) -> Result<RefreshOutcome> {
        let outcome = self.refresh(signal).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh(match &outcome {
                Ok(o) => o.as_str(),
                Err(_) => "failed",
            });
        }
        outcome
    }

    async fn refresh(&self, signal: &Signal) -> Result<RefreshOutcome> {
        let samples = match self.fetch_from_source(signal).await? {
            Fetched::Fresh => None,
            Fetched::Empty => return Ok(RefreshOutcome::NoNewData),
            Fetched::Samples(samples) => Some(samples),
        };
        let outcome = match &samples {
            Some(samples) => RefreshOutcome::Updated {
                samples: samples.len(),
            },
            None => RefreshOutcome::Fresh,
        };

        let configs = self.configs.clone();
        let lookup = Arc::clone(&self.lookup);
        let min_age_ms = self.refresh_min_age_ms;
        let signal = signal.clone();
        tokio::task::spawn_blocking(move || {
            write_tiers(&configs, &lookup, &signal, samples.as_deref(), min_age_ms)
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))??;
        Ok(outcome)
    }

    async fn fetch_from_source(&self, signal: &Signal) -> Result<Fetched> {
        let finest = self.finest();
        let now = now_millis();
        if finest.tier.is_in_cache(signal, finest.width_secs)
            && is_fresh(finest, signal, now, self.refresh_min_age_ms)
        {
            return Ok(Fetched::Fresh);
        }
        let start = Self::incremental_start(finest, signal);

        self.last_attempt.write().insert(signal.clone(), now);
        let reader = self.readers.require(&signal.data_source.kind)?;
        let fetch_started = Instant::now();
        let samples = reader.fetch(signal, start, None, 0).await?;
        tracing::debug!(
            signal = %signal,
            start = ?start,
            samples = samples.len(),
            duration_ms = fetch_started.elapsed().as_millis() as u64,
            "Fetched from data reader"
        );
        Ok(if samples.is_empty() {
            Fetched::Empty
        } else {
            Fetched::Samples(samples)
        })
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Queue a signal for removal by worker 0
    pub fn schedule_signal_for_removal(&self, signal: &Signal) {
        let mut pending = self.pending_removal.lock();
        if !pending.contains(signal) {
            pending.push(signal.clone());
        }
    }

    /// Remove a signal from every tier and from the estimator
    ///
    /// Returns `true` once every tier confirmed; the signal then leaves the
    /// pending queue. Otherwise it stays queued and is retried.
    pub fn perform_signal_removal(&self, signal: &Signal) -> bool {
        let mut complete = true;
        for config in &self.configs {
            match config.tier.remove_signal(signal) {
                Ok(true) => {}
                Ok(false) => complete = false,
                Err(e) => {
                    tracing::warn!(
                        signal = %signal,
                        backend = %config.tier.backend(),
                        error = %e,
                        "Tier failed to remove signal"
                    );
                    complete = false;
                }
            }
        }
        if let Err(e) = self.lookup.delete_signal_estimation(signal) {
            tracing::warn!(signal = %signal, error = %e, "Failed to delete rate estimation");
        }
        if complete {
            self.pending_removal.lock().retain(|s| s != signal);
            tracing::info!(signal = %signal, "Removed signal from cache");
        }
        self.last_attempt.write().remove(signal);
        if let Some(metrics) = &self.metrics {
            metrics.record_removal(complete);
        }
        complete
    }

    /// Snapshot of signals waiting for removal
    pub fn signals_to_remove(&self) -> Vec<Signal> {
        self.pending_removal.lock().clone()
    }

    /// First pending removal, if any
    pub fn next_pending_removal(&self) -> Option<Signal> {
        self.pending_removal.lock().first().cloned()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether the finest tier holds data for `signal`
    ///
    /// An unseen signal is registered in the finest tier with staleness 0, so
    /// the next scheduling round fetches it.
    pub fn is_in_cache(&self, signal: &Signal) -> Result<bool> {
        let finest = self.finest();
        if !finest.tier.signals().contains(signal) {
            finest.tier.add_signal(signal)?;
            self.last_attempt.write().insert(signal.clone(), 0);
            tracing::debug!(signal = %signal, "Registered new signal");
        }
        Ok(finest.tier.is_in_cache(signal, finest.width_secs))
    }

    /// Oldest raw sample of `signal` in the finest tier
    pub fn first_packet_timestamp(&self, signal: &Signal) -> Option<i64> {
        let finest = self.finest();
        finest.tier.first_packet_timestamp(signal, finest.width_secs)
    }

    /// Newest raw sample of `signal` in the finest tier
    pub fn last_packet_timestamp(&self, signal: &Signal) -> Option<i64> {
        let finest = self.finest();
        finest.tier.last_packet_timestamp(signal, finest.width_secs)
    }

    /// Known raw-sample span of `signal`
    pub fn sample_span(&self, signal: &Signal) -> SampleSpan {
        SampleSpan {
            first: self.first_packet_timestamp(signal),
            last: self.last_packet_timestamp(signal),
        }
    }

    /// Every known signal with its last refresh attempt
    pub fn signals_with_staleness(&self) -> Vec<SignalStaleness> {
        self.last_attempt
            .read()
            .iter()
            .map(|(signal, last_attempt)| SignalStaleness {
                signal: signal.clone(),
                last_attempt: *last_attempt,
            })
            .collect()
    }

    /// The level-of-detail lookup fed by refreshes
    pub fn lookup(&self) -> &Arc<DetailLevelLookup> {
        &self.lookup
    }

    /// Attached counters, if any
    pub fn metrics(&self) -> Option<&Arc<CacheMetrics>> {
        self.metrics.as_ref()
    }

    /// Whether every tier finished start-up
    pub fn is_initialized(&self) -> bool {
        self.configs.iter().all(|c| c.tier.is_initialized())
    }

    /// Number of tiers
    pub fn tier_count(&self) -> usize {
        self.configs.len()
    }

    /// Bucket width of tier `index` (0 = coarsest)
    pub fn tier_width(&self, index: usize) -> Result<u32> {
        Ok(self.config(index)?.width_secs)
    }

    /// Entry metadata of tier `index`
    pub fn cached_data_info(&self, index: usize) -> Result<Vec<CachedDataInfo>> {
        Ok(self.config(index)?.tier.cached_data_info())
    }

    /// Known signals of tier `index`
    pub fn signals(&self, index: usize) -> Result<Vec<Signal>> {
        Ok(self.config(index)?.tier.signals())
    }

    /// Counters of tier `index`
    pub fn tier_stats(&self, index: usize) -> Result<TierStats> {
        Ok(self.config(index)?.tier.stats())
    }

    /// Description of tier `index`
    pub fn tier_description(&self, index: usize) -> Result<String> {
        Ok(self.config(index)?.tier.description())
    }

    /// Counters of the finest tier
    pub fn stats(&self) -> TierStats {
        self.finest().tier.stats()
    }
}

/// What a fetch produced for the finest tier
enum Fetched {
    /// The finest tier was updated recently and nothing was fetched
    Fresh,
    /// The reader returned no samples
    Empty,
    Samples(Vec<TimedLocationValue>),
}

fn is_fresh(config: &CacheConfiguration, signal: &Signal, now: i64, min_age_ms: i64) -> bool {
    config
        .tier
        .last_update(signal, config.width_secs)
        .is_some_and(|t| t > now.saturating_sub(min_age_ms))
}

/// Write fetched samples to the finest tier, then derive the coarser ones
///
/// Blocking: called from the blocking pool.
fn write_tiers(
    configs: &[CacheConfiguration],
    lookup: &DetailLevelLookup,
    signal: &Signal,
    samples: Option<&[TimedLocationValue]>,
    min_age_ms: i64,
) -> Result<()> {
    let Some((finest, derived)) = configs.split_last() else {
        return Ok(());
    };
    if let Some(samples) = samples {
        if let Err(e) = lookup.update_sampling_rate_estimation(signal, samples) {
            tracing::warn!(signal = %signal, error = %e, "Sampling rate estimation update failed");
        }
        finest.tier.update_entry(signal, finest.width_secs, samples)?;
    }

    let now = now_millis();
    for config in derived {
        if let Err(e) = derive_tier(finest, config, signal, now, min_age_ms) {
            tracing::warn!(
                signal = %signal,
                width = config.width_secs,
                backend = %config.tier.backend(),
                error = %e,
                "Deriving cache tier failed"
            );
        }
    }
    Ok(())
}

fn derive_tier(
    from: &CacheConfiguration,
    to: &CacheConfiguration,
    signal: &Signal,
    now: i64,
    min_age_ms: i64,
) -> Result<()> {
    if !to.tier.is_in_cache(signal, to.width_secs) {
        to.tier.add_signal(signal)?;
    } else if is_fresh(to, signal, now, min_age_ms) {
        return Ok(());
    }
    let start = CacheManager::incremental_start(to, signal);

    let Some(input) = from
        .tier
        .signal_data(signal, from.width_secs, start, None, false)?
    else {
        tracing::error!(signal = %signal, "Finest tier lost data during derivation");
        return Ok(());
    };
    to.tier.update_entry(signal, to.width_secs, &input)
}
