//! Prometheus text exporter for cache tiers
//!
//! Writes one gauge family per tier statistic, labeled by tier position,
//! backend and bucket width, followed by the counters of the manager's
//! [`CacheMetrics`](crate::observability::CacheMetrics) registry.

use std::fmt::Write;
use std::sync::Arc;

use prometheus::{Encoder, TextEncoder};

use crate::cache::{CacheManager, TierStats};

/// Configuration for Prometheus exporter
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Prefix for all metric names (default: "lod_cache")
    pub metric_prefix: String,
    /// Append the counters registered by the cache manager
    pub include_counters: bool,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            metric_prefix: "lod_cache".to_string(),
            include_counters: true,
        }
    }
}

/// Prometheus metrics exporter
pub struct PrometheusExporter {
    config: PrometheusConfig,
    manager: Arc<CacheManager>,
}

struct TierSample {
    index: usize,
    width_secs: u32,
    stats: TierStats,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    pub fn new(config: PrometheusConfig, manager: Arc<CacheManager>) -> Self {
        Self { config, manager }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut output = String::new();
        let prefix = &self.config.metric_prefix;

        let tiers: Vec<TierSample> = (0..self.manager.tier_count())
            .filter_map(|index| {
                Some(TierSample {
                    index,
                    width_secs: self.manager.tier_width(index).ok()?,
                    stats: self.manager.tier_stats(index).ok()?,
                })
            })
            .collect();
        self.export_tier_metrics(&mut output, prefix, &tiers);

        if self.config.include_counters {
            match self.export_registry() {
                Ok(counters) => output.push_str(&counters),
                Err(e) => tracing::warn!(error = %e, "Failed to encode cache counters"),
            }
        }

        output
    }

    fn export_tier_metrics(&self, output: &mut String, prefix: &str, tiers: &[TierSample]) {
        let families: [(&str, &str, &str, fn(&TierStats) -> f64); 8] = [
            ("tier_entries", "Cached (signal, width) entries", "gauge", |s| s.entries as f64),
            ("tier_signals", "Signals known to the tier", "gauge", |s| s.signals as f64),
            ("tier_size_bytes", "Approximate bytes of stored elements", "gauge", |s| {
                s.size_bytes as f64
            }),
            ("tier_requests_total", "Counted read requests", "counter", |s| s.requests as f64),
            ("tier_hits_total", "Reads answered from an entry", "counter", |s| s.hits as f64),
            ("tier_misses_total", "Reads without matching entry", "counter", |s| s.misses as f64),
            ("tier_hit_rate", "Hit rate of counted reads (0.0-1.0)", "gauge", |s| s.hit_rate()),
            ("tier_uptime_seconds", "Seconds since the tier was created", "gauge", |s| {
                s.uptime_secs as f64
            }),
        ];

        for (name, help, kind, value) in families {
            let _ = writeln!(output, "# HELP {}_{} {}", prefix, name, help);
            let _ = writeln!(output, "# TYPE {}_{} {}", prefix, name, kind);
            for tier in tiers {
                let _ = writeln!(
                    output,
                    "{}_{}{{tier=\"{}\",backend=\"{}\",width=\"{}\"}} {}",
                    prefix,
                    name,
                    tier.index,
                    tier.stats.backend,
                    tier.width_secs,
                    value(&tier.stats)
                );
            }
            output.push('\n');
        }
    }

    fn export_registry(&self) -> Result<String, String> {
        let Some(metrics) = self.manager.metrics() else {
            return Ok(String::new());
        };
        let encoder = TextEncoder::new();
        let metric_families = metrics.registry().gather();
        let mut buffer = vec![];

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| format!("Failed to encode metrics: {}", e))?;

        String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
    }

    /// Export metrics as HTTP response body with correct content type
    pub fn export_http(&self) -> (String, &'static str) {
        let body = self.export();
        let content_type = "text/plain; version=0.0.4; charset=utf-8";
        (body, content_type)
    }
}
