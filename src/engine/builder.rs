//! Engine builder with pluggable data readers

use std::path::Path;
use std::sync::Arc;

use crate::cache::{CacheConfiguration, CacheManager, CacheTier, MemoryTier, SqlTier};
use crate::config::{EngineConfig, TierKind};
use crate::error::{Error, Result};
use crate::estimation::{DetailLevelLookup, EstimationStore};
use crate::observability::{CacheMetrics, PrometheusConfig};
use crate::reader::{DataReader, ReaderRegistry};
use crate::services::{WorkerPool, WorkerScheduler};

use super::Engine;

/// Builder wiring tiers, readers and workers into an [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    readers: ReaderRegistry,
    metrics: PrometheusConfig,
}

impl EngineBuilder {
    /// Create a builder with default configuration and no readers
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            readers: ReaderRegistry::new(),
            metrics: PrometheusConfig::default(),
        }
    }

    /// Set engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the reader serving sources of `kind`
    pub fn with_reader(mut self, kind: impl Into<String>, reader: Arc<dyn DataReader>) -> Self {
        self.readers.register(kind, reader);
        self
    }

    /// Set exporter settings, including the metric name prefix
    pub fn with_metrics_config(mut self, metrics: PrometheusConfig) -> Self {
        self.metrics = metrics;
        self
    }

    /// Open tiers, restore estimators and assemble the engine
    ///
    /// Workers are not started; call [`Engine::start_workers`] from within a
    /// Tokio runtime.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        if self.readers.kinds().is_empty() {
            tracing::warn!("No data readers registered, refreshes will fail");
        }
        let policy = self.config.storage_policy();

        let mut configs = Vec::with_capacity(self.config.tiers.len());
        for spec in &self.config.tiers {
            let tier: Arc<dyn CacheTier> = match spec.kind {
                TierKind::Memory => Arc::new(MemoryTier::new(policy)),
                TierKind::Sql => {
                    let path = self.sql_path()?;
                    let prefix = format!("lod_{}_", spec.bucket_width_secs);
                    Arc::new(SqlTier::open(path, &prefix, policy)?)
                }
            };
            tracing::debug!(
                backend = %tier.backend(),
                width = spec.bucket_width_secs,
                "Opened cache tier"
            );
            configs.push(CacheConfiguration::new(tier, spec.bucket_width_secs));
        }

        let lookup = match &self.config.sql_path {
            Some(path) => DetailLevelLookup::with_store(
                EstimationStore::open(path)?,
                self.config.estimator_persist_interval_secs,
            ),
            None => DetailLevelLookup::new(),
        };
        lookup.load()?;

        let metrics = Arc::new(CacheMetrics::new(&self.metrics.metric_prefix)?);
        let manager = CacheManager::new(configs, self.readers.clone(), Arc::new(lookup))?
            .with_refresh_min_age(self.config.refresh_min_age())
            .with_location_decimals(self.config.location_decimals)
            .with_metrics(metrics);
        let manager = Arc::new(manager);

        let scheduler = Arc::new(WorkerScheduler::new(
            Arc::clone(&manager),
            self.config.worker_threads,
        ));
        let workers = WorkerPool::new(scheduler, self.config.update_interval());

        Ok(Engine {
            manager,
            readers: self.readers,
            workers,
            metrics: self.metrics,
            config: self.config,
        })
    }

    fn sql_path(&self) -> Result<&Path> {
        self.config
            .sql_path
            .as_deref()
            .ok_or_else(|| Error::Configuration("sql tier requires sql_path".to_string()))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierSpec;
    use tempfile::TempDir;

    #[test]
    fn test_builder_creation() {
        let builder = EngineBuilder::new();
        assert!(builder.readers.kinds().is_empty());
        assert_eq!(builder.config, EngineConfig::default());
    }

    #[test]
    fn test_build_default_memory_tiers() {
        let engine = EngineBuilder::new().build().unwrap();
        assert_eq!(engine.manager().tier_count(), 2);
        assert_eq!(engine.manager().tier_width(1).unwrap(), 240);
        assert!(engine.manager().is_initialized());
    }

    #[test]
    fn test_build_with_sql_tier() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            sql_path: Some(dir.path().join("cache.db")),
            tiers: vec![TierSpec::memory(60), TierSpec::sql(3_600)],
            ..Default::default()
        };
        let engine = EngineBuilder::new().with_config(config).build().unwrap();
        assert!(engine.manager().tier_description(0).unwrap().contains("lod_3600_"));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = EngineConfig {
            tiers: vec![TierSpec::sql(60)],
            ..Default::default()
        };
        assert!(matches!(
            EngineBuilder::new().with_config(config).build(),
            Err(Error::Configuration(_))
        ));
    }
}
