//! QuantCache - Adaptive Performance Layer
//!
//! An in-process performance layer for compute-heavy strategy services:
//! a file-backed result cache, a worker pool that resizes itself from
//! resource trends, an auto-tuner closing the loop over both, and a
//! precompute engine that warms the cache ahead of demand.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       Optimization Layer                            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐      trends      ┌──────────────┐                 │
//! │  │   Monitor    │─────────────────▶│  Auto-Tuner  │                 │
//! │  │              │◀──┐              └──────┬───────┘                 │
//! │  └──────────────┘   │ operations          │ max_bytes / resize      │
//! │                     │              ┌──────▼───────┐                 │
//! │  ┌──────────────┐   └──────────────│ Worker Pool  │                 │
//! │  │  Precompute  │─── jobs ────────▶│              │                 │
//! │  │    Engine    │                  └──────────────┘                 │
//! │  └──────┬───────┘                  ┌──────────────┐                 │
//! │         └──── results ────────────▶│ Cache Store  │                 │
//! │                                    └──────────────┘                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Content-addressed file cache with TTL and LRU eviction
//! - [`monitoring`] - Resource sampling, operation tracking, trends, health
//! - [`pool`] - Adaptive worker pool
//! - [`tuner`] - Auto-tuning control loop
//! - [`precompute`] - Usage-driven precomputation
//! - [`layer`] - Composition root
//! - [`config`] - Typed configuration
//! - [`error`] - Error types

pub mod background;
pub mod cache;
pub mod config;
pub mod error;
pub mod layer;
pub mod monitoring;
pub mod pool;
pub mod precompute;
pub mod tuner;

// Re-export commonly used types
pub use cache::{CacheCategory, CacheConfig, CacheStore};
pub use config::OptimizerConfig;
pub use error::{Error, Result};
pub use layer::{global, install_global, LayerStatus, OptimizationLayer};
pub use monitoring::{PerformanceMonitor, ResourceTrend};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkloadClass};
pub use precompute::{PrecomputeEngine, StrategyExecutor};
pub use tuner::{AutoTuner, TuningRecommendation};
