//! Prometheus counters for cache activity
//!
//! Counters live in a private [`Registry`] owned by the engine, so several
//! engines in one process never collide on metric names.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::error::{Error, Result};

/// Counters updated by the cache manager
pub struct CacheMetrics {
    registry: Registry,
    refreshes: IntCounterVec,
    tier_reads: IntCounterVec,
    live_aggregations: IntCounter,
    removals: IntCounterVec,
}

fn registration(e: prometheus::Error) -> Error {
    Error::Configuration(format!("metric registration failed: {}", e))
}

impl CacheMetrics {
    /// Create and register all counters with metric names under `prefix`
    pub fn new(prefix: &str) -> Result<Self> {
        let registry = Registry::new();

        let refreshes = IntCounterVec::new(
            Opts::new(
                format!("{}_refreshes_total", prefix),
                "Signal refresh attempts by outcome",
            ),
            &["outcome"],
        )
        .map_err(registration)?;
        let tier_reads = IntCounterVec::new(
            Opts::new(
                format!("{}_tier_reads_total", prefix),
                "Reads served by a cache tier, by backend",
            ),
            &["backend"],
        )
        .map_err(registration)?;
        let live_aggregations = IntCounter::new(
            format!("{}_live_aggregations_total", prefix),
            "Reads that needed on-the-fly re-aggregation",
        )
        .map_err(registration)?;
        let removals = IntCounterVec::new(
            Opts::new(
                format!("{}_removals_total", prefix),
                "Signal removal attempts by result",
            ),
            &["result"],
        )
        .map_err(registration)?;

        registry
            .register(Box::new(refreshes.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(tier_reads.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(live_aggregations.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(removals.clone()))
            .map_err(registration)?;

        Ok(Self {
            registry,
            refreshes,
            tier_reads,
            live_aggregations,
            removals,
        })
    }

    /// Count a refresh attempt (`updated`, `fresh`, `empty`, `failed`)
    pub fn record_refresh(&self, outcome: &str) {
        self.refreshes.with_label_values(&[outcome]).inc();
    }

    /// Count a read answered by a tier
    pub fn record_tier_read(&self, backend: &str) {
        self.tier_reads.with_label_values(&[backend]).inc();
    }

    /// Count a read re-aggregated on the fly
    pub fn record_live_aggregation(&self) {
        self.live_aggregations.inc();
    }

    /// Count a removal attempt
    pub fn record_removal(&self, complete: bool) {
        let result = if complete { "complete" } else { "incomplete" };
        self.removals.with_label_values(&[result]).inc();
    }

    /// Refresh attempts recorded for `outcome`
    pub fn refreshes(&self, outcome: &str) -> u64 {
        self.refreshes.with_label_values(&[outcome]).get()
    }

    /// Live re-aggregations recorded
    pub fn live_aggregations(&self) -> u64 {
        self.live_aggregations.get()
    }

    /// The registry holding these counters
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = CacheMetrics::new("lod_cache").unwrap();
        metrics.record_refresh("updated");
        metrics.record_refresh("updated");
        metrics.record_refresh("failed");
        metrics.record_live_aggregation();
        assert_eq!(metrics.refreshes("updated"), 2);
        assert_eq!(metrics.refreshes("failed"), 1);
        assert_eq!(metrics.live_aggregations(), 1);
        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();
        assert!(names.contains(&"lod_cache_refreshes_total".to_string()));
        assert!(names.contains(&"lod_cache_live_aggregations_total".to_string()));
    }
}
