//! Precompute Engine
//!
//! Usage-driven warm-up of the result cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Precompute Engine                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  track_request ──▶ UsageTracker (log + counts) ──▶ top N             │
//! │                                                     │                │
//! │                     skip fresh / unregistered ◀─────┘                │
//! │                                │                                     │
//! │              jobs by priority ─┴─▶ WorkerPool ──▶ CacheStore         │
//! │                                                   (precomputed)      │
//! │  check_precomputed_result ───────────────────────────▲               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

mod engine;
mod job;
mod usage;

pub use engine::{
    CycleSummary, ExecutorError, PrecomputeConfig, PrecomputeEngine, PrecomputeStatus,
    StrategyExecutor, USAGE_STATE_FILE,
};
pub use job::{JobStatus, PrecomputeJob};
pub use usage::{combination_signature, ParameterCombination, RequestRecord, UsageTracker};
