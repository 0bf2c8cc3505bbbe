//! Tiered level-of-detail cache
//!
//! Each tier stores aggregates of a signal at one bucket width. The manager
//! routes reads to the coarsest tier that still satisfies the requested
//! width and keeps the tiers filled from the external readers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       CacheManager                           │
//! │         (read routing, refresh, removal, staleness)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   ┌──────────────┐    ┌──────────────┐    ┌──────────────┐   │
//! │   │  86400 s     │    │  3600 s      │    │  240 s       │   │
//! │   │  SqlTier     │◀───│  MemoryTier  │◀───│  MemoryTier  │◀── reader
//! │   └──────────────┘    └──────────────┘    └──────────────┘   │
//! │        coarsest                                 finest        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod manager;
mod memory;
mod sql;
mod tier;

pub use manager::{CacheConfiguration, CacheManager, RefreshOutcome, DEFAULT_REFRESH_MIN_AGE};
pub use memory::MemoryTier;
pub use sql::SqlTier;
pub use tier::{CacheTier, TierBackend, TierCounters, TierStats};
