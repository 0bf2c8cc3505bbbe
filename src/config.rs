//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file works.
//!
//! ```toml
//! worker_threads = 2
//! update_interval_ms = 5000
//! sql_path = "/var/lib/lod-cache/cache.db"
//!
//! [[tiers]]
//! kind = "sql"
//! bucket_width_secs = 86400
//!
//! [[tiers]]
//! kind = "memory"
//! bucket_width_secs = 240
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{
    StoragePolicy, DEFAULT_HEADROOM_SECS, DEFAULT_LOCATION_DECIMALS, DEFAULT_MIN_HEADROOM_BUCKETS,
};

/// Environment variable naming a configuration file
pub const CONFIG_ENV_VAR: &str = "LOD_CACHE_CONFIG";

/// Backend of a configured tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Process memory
    Memory,
    /// SQLite database at `sql_path`
    Sql,
}

/// One configured tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    /// Storage backend
    pub kind: TierKind,
    /// Bucket width in seconds
    pub bucket_width_secs: u32,
}

impl TierSpec {
    /// In-memory tier at `bucket_width_secs`
    pub fn memory(bucket_width_secs: u32) -> Self {
        Self {
            kind: TierKind::Memory,
            bucket_width_secs,
        }
    }

    /// SQLite tier at `bucket_width_secs`
    pub fn sql(bucket_width_secs: u32) -> Self {
        Self {
            kind: TierKind::Sql,
            bucket_width_secs,
        }
    }
}

/// Engine configuration loaded from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of refresh workers
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Sleep between two rounds of a worker (ms)
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Minimum entry age before a tier is refreshed again (s)
    #[serde(default = "default_refresh_min_age_secs")]
    pub refresh_min_age_secs: u64,

    /// Tiers in any order; the smallest width is fetched from source
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierSpec>,

    /// SQLite file for SQL tiers and estimator persistence
    #[serde(default)]
    pub sql_path: Option<PathBuf>,

    /// Decimal places kept when grouping by location
    #[serde(default = "default_location_decimals")]
    pub location_decimals: u32,

    /// Time span reserved when a store grows (s)
    #[serde(default = "default_headroom_secs")]
    pub headroom_secs: u64,

    /// Minimum buckets reserved when a store grows
    #[serde(default = "default_min_headroom_buckets")]
    pub min_headroom_buckets: usize,

    /// Minimum time between two estimator writes (s)
    #[serde(default = "default_estimator_persist_interval_secs")]
    pub estimator_persist_interval_secs: u64,
}

fn default_worker_threads() -> usize {
    1
}

fn default_update_interval_ms() -> u64 {
    5000
}

fn default_refresh_min_age_secs() -> u64 {
    120
}

fn default_tiers() -> Vec<TierSpec> {
    vec![TierSpec::memory(3_600), TierSpec::memory(240)]
}

fn default_location_decimals() -> u32 {
    DEFAULT_LOCATION_DECIMALS
}

fn default_headroom_secs() -> u64 {
    DEFAULT_HEADROOM_SECS
}

fn default_min_headroom_buckets() -> usize {
    DEFAULT_MIN_HEADROOM_BUCKETS
}

fn default_estimator_persist_interval_secs() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            update_interval_ms: default_update_interval_ms(),
            refresh_min_age_secs: default_refresh_min_age_secs(),
            tiers: default_tiers(),
            sql_path: None,
            location_decimals: default_location_decimals(),
            headroom_secs: default_headroom_secs(),
            min_headroom_buckets: default_min_headroom_buckets(),
            estimator_persist_interval_secs: default_estimator_persist_interval_secs(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load from the file named by `LOD_CACHE_CONFIG`, or use defaults
    ///
    /// A file that cannot be read or parsed is logged and ignored.
    pub fn from_env_or_default() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            match Self::load(Path::new(&path)) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to load config file, using defaults");
                }
            }
        }
        tracing::info!("Using default configuration");
        Self::default()
    }

    /// Check tier list, worker count and SQL settings
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Configuration("worker_threads must be at least 1".to_string()));
        }
        if self.tiers.is_empty() {
            return Err(Error::Configuration("at least one tier is required".to_string()));
        }
        let mut widths = HashSet::new();
        for tier in &self.tiers {
            if tier.bucket_width_secs == 0 {
                return Err(Error::Configuration("bucket_width_secs must be positive".to_string()));
            }
            if !widths.insert(tier.bucket_width_secs) {
                return Err(Error::Configuration(format!(
                    "duplicate bucket width {}s",
                    tier.bucket_width_secs
                )));
            }
            if tier.kind == TierKind::Sql && self.sql_path.is_none() {
                return Err(Error::Configuration("sql tier requires sql_path".to_string()));
            }
        }
        Ok(())
    }

    /// Growth and precision policy for the tiers
    pub fn storage_policy(&self) -> StoragePolicy {
        StoragePolicy {
            headroom_secs: self.headroom_secs,
            min_headroom_buckets: self.min_headroom_buckets,
            location_decimals: self.location_decimals,
        }
    }

    /// Sleep between worker rounds
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Minimum entry age before a refresh
    pub fn refresh_min_age(&self) -> Duration {
        Duration::from_secs(self.refresh_min_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.update_interval(), Duration::from_secs(5));
        assert_eq!(config.refresh_min_age(), Duration::from_secs(120));
        assert_eq!(config.tiers.len(), 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.storage_policy(), StoragePolicy::default());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            worker_threads = 3
            sql_path = "cache.db"

            [[tiers]]
            kind = "sql"
            bucket_width_secs = 86400

            [[tiers]]
            kind = "memory"
            bucket_width_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.update_interval_ms, 5000);
        assert_eq!(config.tiers, vec![TierSpec::sql(86_400), TierSpec::memory(60)]);
        assert_eq!(config.sql_path, Some(PathBuf::from("cache.db")));
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "worker_threads = 0",
            "tiers = []",
            "[[tiers]]\nkind = \"memory\"\nbucket_width_secs = 0",
            "[[tiers]]\nkind = \"memory\"\nbucket_width_secs = 60\n[[tiers]]\nkind = \"sql\"\nbucket_width_secs = 60",
            "[[tiers]]\nkind = \"sql\"\nbucket_width_secs = 60",
            "[[tiers]]\nkind = \"disk\"\nbucket_width_secs = 60",
        ];
        for case in cases {
            assert!(
                matches!(EngineConfig::from_toml_str(case), Err(Error::Configuration(_))),
                "accepted: {}",
                case
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lod.toml");
        std::fs::write(&path, "update_interval_ms = 250\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.update_interval(), Duration::from_millis(250));

        assert!(matches!(
            EngineConfig::load(&dir.path().join("missing.toml")),
            Err(Error::Io(_))
        ));
    }
}
