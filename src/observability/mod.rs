//! Observability for the cache engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            PrometheusExporter                │
//! │  tier gauges  +  CacheMetrics registry text  │
//! └──────────┬──────────────────────┬───────────┘
//!            │                      │
//!   ┌────────▼────────┐    ┌────────▼────────┐
//!   │ CacheTier stats │    │  CacheMetrics   │
//!   │ (atomic counts) │    │ (prometheus)    │
//!   └─────────────────┘    └─────────────────┘
//! ```

pub mod metrics;
pub mod prometheus_exporter;

pub use metrics::CacheMetrics;
pub use prometheus_exporter::{PrometheusConfig, PrometheusExporter};
