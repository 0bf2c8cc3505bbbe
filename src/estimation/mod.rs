//! Sampling-rate estimation and level-of-detail lookup

mod lookup;
mod sampling;
mod store;

pub use lookup::{DetailLevelLookup, SampleSpan, MIN_WINDOW_LENGTH_SECS};
pub use sampling::{
    SamplingRateEstimation, FALLBACK_SAMPLING_RATE, MIN_RELATIVE_CHANGE, MIN_SAMPLES_PER_MONTH,
    MONTHS_PER_GROWTH,
};
pub use store::EstimationStore;
