//! Background refresh services
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  claim / release  ┌──────────────────┐
//! │  UpdateWorker 0 │──────────────────▶│                  │
//! ├─────────────────┤                   │ WorkerScheduler  │──▶ CacheManager
//! │  UpdateWorker 1 │──────────────────▶│ (one claim lock) │
//! ├─────────────────┤                   │                  │
//! │       ...       │──────────────────▶│                  │
//! └─────────────────┘                   └──────────────────┘
//!          ▲
//!          │ start / shutdown
//! ┌─────────────────┐
//! │   WorkerPool    │
//! └─────────────────┘
//! ```
//!
//! Worker 0 also drains the pending-removal queue at the start of each
//! round.

pub mod scheduler;
pub mod worker;

pub use scheduler::WorkerScheduler;
pub use worker::{UpdateWorker, WorkerPool, DEFAULT_UPDATE_INTERVAL};
