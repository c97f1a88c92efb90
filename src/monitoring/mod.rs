//! Resource & Performance Monitoring
//!
//! Periodic resource sampling, explicit open/close operation tracking and
//! cheap trend queries over rolling windows.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Performance Monitor                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ResourceSampler ──▶ RingBuffer<ResourceSnapshot> ──▶ ResourceTrend      │
//! │                                                                          │
//! │  start_operation ─┐                                                      │
//! │  record_error     ├─▶ open ops ──▶ operation log ──▶ PerformanceSnapshot │
//! │  end_operation   ─┘                    │                  │              │
//! │                                        ▼                  ▼              │
//! │                              MetricsCollector    PerformanceTrend        │
//! │                                        │                                 │
//! │                    MetricSink ◀── MetricRecord stream                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Trend direction is a correlation coefficient, so consumers ask "is this
//! rising" rather than reading absolute history.

mod collector;
mod health;
mod monitor;
mod sampler;
mod sink;
mod snapshot;
mod trend;

pub use collector::{Counter, Gauge, Histogram, HistogramBucket, MetricsCollector};
pub use health::{HealthCheck, HealthCheckResult, HealthResponse, HealthStatus};
pub use monitor::{
    CompletedOperation, MonitorConfig, OperationHandle, PerformanceMonitor, MEMORY_MB_METRIC,
};
pub use sampler::{ResourceSampler, ScriptedSampler, SysinfoSampler};
pub use sink::{
    CompositeMetricSink, InMemoryMetricSink, JsonLinesMetricSink, MetricCategory, MetricRecord,
    MetricSink, TracingMetricSink,
};
pub use snapshot::{PerformanceSnapshot, ResourceSnapshot, RingBuffer, Timestamped};
pub use trend::{index_correlation, PerformanceTrend, ResourceTrend, TrendSummary};
