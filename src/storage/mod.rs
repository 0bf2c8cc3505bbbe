//! Dense time-indexed storage for cached aggregates
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 IndexedEntry                          │
//! │  signal, width, first/last packet, last update, hits  │
//! ├──────────────────────────┬───────────────────────────┤
//! │  ValueIndex              │  LocatedIndex              │
//! │  [Option<f64>; buckets]  │  translation → flat arrays │
//! └──────────────────────────┴───────────────────────────┘
//! ```
//!
//! Both layouts address buckets as `(t - anchor) / width` and grow by a
//! [`StoragePolicy`] headroom.

mod entry;
mod indexed;
mod located;
mod policy;

pub use entry::{EntryLayout, IndexedEntry, LOCATED_ELEMENT_BYTES, VALUE_ELEMENT_BYTES};
pub use indexed::ValueIndex;
pub use located::LocatedIndex;
pub use policy::{
    StoragePolicy, DEFAULT_HEADROOM_SECS, DEFAULT_LOCATION_DECIMALS, DEFAULT_MIN_HEADROOM_BUCKETS,
};
