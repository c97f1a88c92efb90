//! Auto-Tuner
//!
//! A periodic `sample -> recommend -> apply` control loop over the cache
//! ceiling, the worker pool width and the shared processing limits.
//!
//! Rules fire on monitor trends and carry a fixed confidence. Every rule
//! output is reported; only those at or above the configured threshold are
//! applied, and applied changes land in a bounded history.

mod auto_tuner;
mod limits;
mod recommendation;

pub use auto_tuner::{AutoTuner, AutoTunerConfig, CycleReport, TunerStatus};
pub use limits::{ProcessingLimits, SharedLimits};
pub use recommendation::{
    recommend, AppliedRecommendation, PerformanceTargets, TunedComponent, TunedParameter,
    TunedValues, TuningRecommendation, RISING_DIRECTION,
};
