//! Level-of-detail cache for time-series sensor readings
//!
//! Keeps signals fetched from external sources aggregated at several bucket
//! widths, picks the width that answers a request within a point budget and
//! refreshes tiers in the background.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Engine                              │
//! │  get_signal_data · window_length · can_serve_unaggregated     │
//! ├───────────────────┬────────────────────────┬─────────────────┤
//! │  CacheManager     │  DetailLevelLookup     │  WorkerPool     │
//! │  (tiers, routing) │  (sampling rates)      │  (refreshes)    │
//! ├───────────────────┴────────────────────────┴─────────────────┤
//! │   MemoryTier / SqlTier  ──▶  IndexedEntry (dense buckets)     │
//! └──────────────────────────────────────────────────────────────┘
//!                ▲
//!                │ fetch
//!          DataReader (per source kind)
//! ```

#![warn(missing_docs)]

pub mod aggregation;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimation;
pub mod observability;
pub mod reader;
pub mod services;
pub mod storage;
pub mod types;

pub use cache::{CacheConfiguration, CacheManager, CacheTier, MemoryTier, SqlTier};
pub use config::{EngineConfig, TierKind, TierSpec};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, ReaderError, Result, StorageError};
pub use reader::{DataReader, ReaderRegistry};
pub use types::{
    CachedDataInfo, DataSource, DeviceSelect, Location, SelectKind, Signal, SignalStaleness,
    TimedLocationValue, TimedValue,
};
