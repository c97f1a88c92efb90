//! Adaptive Worker Pool
//!
//! Bounded task execution whose width follows the monitor's resource and
//! latency trends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Worker Pool                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  submit ──▶ autoscale check ──▶ ExecutionContext (semaphore) ──▶ │
//! │               │                        ▲          spawn_blocking │
//! │               ▼                        │ swap after drain        │
//! │   ResourceTrend + PerformanceTrend ─▶ decide_resize ─▶ resize    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod executor;
mod sizing;

pub use config::{WorkerPoolConfig, WorkloadClass};
pub use executor::{PoolState, PoolStats, TaskHandle, WorkerPool};
pub use sizing::{
    decide_resize, initial_worker_count, resize_step, ResizeDecision, ResizeInputs, CPU_HIGH_PCT,
    CPU_LOW_PCT, LATENCY_DEGRADING,
};
