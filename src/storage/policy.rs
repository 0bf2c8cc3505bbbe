//! Growth and precision policy shared by the indexed stores

use serde::{Deserialize, Serialize};

/// Default growth headroom: 31 days
pub const DEFAULT_HEADROOM_SECS: u64 = 2_678_400;

/// Default minimum number of extra buckets on growth
pub const DEFAULT_MIN_HEADROOM_BUCKETS: usize = 10;

/// Default rounding precision for location grouping (~11 m at the equator)
pub const DEFAULT_LOCATION_DECIMALS: u32 = 4;

/// How stores grow and how locations are grouped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePolicy {
    /// Time span of extra buckets reserved whenever an array must grow
    pub headroom_secs: u64,
    /// Lower bound on extra buckets reserved on growth
    pub min_headroom_buckets: usize,
    /// Decimal places kept when grouping samples by location
    pub location_decimals: u32,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            headroom_secs: DEFAULT_HEADROOM_SECS,
            min_headroom_buckets: DEFAULT_MIN_HEADROOM_BUCKETS,
            location_decimals: DEFAULT_LOCATION_DECIMALS,
        }
    }
}

impl StoragePolicy {
    /// Extra buckets to reserve beyond the required size for `width_secs`
    pub fn headroom_buckets(&self, width_secs: u32) -> usize {
        let width = u64::from(width_secs.max(1));
        let span = ((self.headroom_secs as f64) / width as f64).round() as usize;
        span.max(self.min_headroom_buckets)
    }
}
