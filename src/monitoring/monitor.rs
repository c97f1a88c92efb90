//! Resource & Performance Monitor
//!
//! Two independent ring buffers (resource and performance snapshots), a log
//! of completed operations, and the set of operations still open. Open
//! operations live in a concurrent map so sampling never waits on them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::collector::MetricsCollector;
use super::sampler::{ResourceSampler, SysinfoSampler};
use super::sink::{MetricCategory, MetricRecord, MetricSink, TracingMetricSink};
use super::snapshot::{PerformanceSnapshot, ResourceSnapshot, RingBuffer};
use super::trend::{PerformanceTrend, ResourceTrend};
use crate::background::BackgroundLoop;
use crate::config::ensure;
use crate::error::Result;

// =============================================================================
// Configuration
// =============================================================================

/// Monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Resource sampling period of the background loop
    #[serde(with = "crate::config::duration_serde")]
    pub sample_interval: Duration,
    /// Capacity of each snapshot ring buffer
    pub history_capacity: usize,
    /// Window of completed operations summarised by a performance snapshot
    #[serde(with = "crate::config::duration_serde")]
    pub performance_window: Duration,
    /// Completed operations required in the window for a performance snapshot
    pub min_operations: usize,
    /// Cap on the completed-operation log
    pub operation_log_capacity: usize,
    /// Cap on the in-memory metric record stream
    pub metric_stream_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            history_capacity: 720,
            performance_window: Duration::from_secs(60),
            min_operations: 3,
            operation_log_capacity: 10_000,
            metric_stream_capacity: 10_000,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure(!self.sample_interval.is_zero(), || {
            "monitor.sample_interval must be > 0".to_string()
        })?;
        ensure(!self.performance_window.is_zero(), || {
            "monitor.performance_window must be > 0".to_string()
        })?;
        ensure(self.history_capacity > 0, || {
            "monitor.history_capacity must be > 0".to_string()
        })?;
        ensure(self.operation_log_capacity > 0, || {
            "monitor.operation_log_capacity must be > 0".to_string()
        })?;
        ensure(self.min_operations > 0, || {
            "monitor.min_operations must be > 0".to_string()
        })?;
        Ok(())
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Handle to an open operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    id: Uuid,
    name: String,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct ActiveOperation {
    tags: BTreeMap<String, String>,
    started: Instant,
    started_at: DateTime<Utc>,
    errors: Vec<String>,
    cache_hits: u64,
    cache_misses: u64,
}

/// A finished operation as kept in the operation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOperation {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub errors: Vec<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub extra_metrics: BTreeMap<String, f64>,
}

impl CompletedOperation {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Extra metric key used to derive memory efficiency (ops per MiB)
pub const MEMORY_MB_METRIC: &str = "memory_mb";

// =============================================================================
// Monitor
// =============================================================================

/// Samples resources, tracks operations and answers trend queries
pub struct PerformanceMonitor {
    config: MonitorConfig,
    sampler: Arc<dyn ResourceSampler>,
    sink: Arc<dyn MetricSink>,
    collector: MetricsCollector,
    resources: Mutex<RingBuffer<ResourceSnapshot>>,
    performance: Mutex<RingBuffer<PerformanceSnapshot>>,
    active: DashMap<Uuid, ActiveOperation>,
    completed: Mutex<VecDeque<CompletedOperation>>,
    background: BackgroundLoop,
}

impl PerformanceMonitor {
    /// Create a monitor with an explicit sampler and metric sink
    pub fn new(
        config: MonitorConfig,
        sampler: Arc<dyn ResourceSampler>,
        sink: Arc<dyn MetricSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resources: Mutex::new(RingBuffer::new(config.history_capacity)),
            performance: Mutex::new(RingBuffer::new(config.history_capacity)),
            active: DashMap::new(),
            completed: Mutex::new(VecDeque::new()),
            collector: MetricsCollector::default(),
            background: BackgroundLoop::new("performance-monitor"),
            config,
            sampler,
            sink,
        })
    }

    /// Monitor sampling the host through `sysinfo`, metrics to `tracing`
    pub fn with_system_sampler(config: MonitorConfig) -> Arc<Self> {
        Self::new(
            config,
            Arc::new(SysinfoSampler::new()),
            Arc::new(TracingMetricSink::debug_level()),
        )
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    /// Prometheus text export of the collector
    pub fn export_text(&self) -> String {
        self.collector.export_text()
    }

    fn emit(&self, record: MetricRecord) {
        self.sink.record(&record);
    }

    /// Emit a record on behalf of another component
    pub fn emit_metric(&self, record: MetricRecord) {
        self.emit(record);
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Open an operation
    pub fn start_operation(
        &self,
        name: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> OperationHandle {
        let handle = OperationHandle {
            id: Uuid::new_v4(),
            name: name.into(),
        };
        self.active.insert(
            handle.id,
            ActiveOperation {
                tags,
                started: Instant::now(),
                started_at: Utc::now(),
                errors: Vec::new(),
                cache_hits: 0,
                cache_misses: 0,
            },
        );
        self.collector.gauge("active_operations").inc();
        handle
    }

    /// Record an error against an open operation. Returns `false` if the
    /// operation is not open.
    pub fn record_error(&self, handle: &OperationHandle, message: impl Into<String>) -> bool {
        let message = message.into();
        let Some(mut op) = self.active.get_mut(&handle.id) else {
            return false;
        };
        op.errors.push(message.clone());
        let tags = op.tags.clone();
        drop(op);

        self.collector.counter("operation_errors_total").inc();
        debug!(operation = %handle.name, error = %message, "Operation error recorded");
        self.emit(
            MetricRecord::new("operation_error", 1.0, "count", MetricCategory::Operation)
                .with_tags(tags)
                .with_tag("operation", handle.name.clone()),
        );
        true
    }

    /// Add cache hits/misses observed by an open operation
    pub fn record_cache_stats(&self, handle: &OperationHandle, hits: u64, misses: u64) -> bool {
        let Some(mut op) = self.active.get_mut(&handle.id) else {
            return false;
        };
        op.cache_hits += hits;
        op.cache_misses += misses;
        drop(op);

        self.collector.counter("cache_hits_total").add(hits);
        self.collector.counter("cache_misses_total").add(misses);
        true
    }

    /// Close an operation, attaching `extra_metrics` (e.g. `memory_mb`).
    ///
    /// Returns `None` if the handle was already closed.
    pub fn end_operation(
        &self,
        handle: OperationHandle,
        extra_metrics: BTreeMap<String, f64>,
    ) -> Option<CompletedOperation> {
        let (_, op) = self.active.remove(&handle.id)?;
        let duration_ms = op.started.elapsed().as_secs_f64() * 1_000.0;

        let completed = CompletedOperation {
            name: handle.name,
            tags: op.tags,
            started_at: op.started_at,
            ended_at: Utc::now(),
            duration_ms,
            errors: op.errors,
            cache_hits: op.cache_hits,
            cache_misses: op.cache_misses,
            extra_metrics,
        };

        self.collector.gauge("active_operations").dec();
        self.collector.counter("operations_total").inc();
        self.collector
            .histogram("operation_duration_ms")
            .observe(duration_ms);

        let mut tags = completed.tags.clone();
        tags.insert("operation".to_string(), completed.name.clone());
        tags.insert("success".to_string(), completed.succeeded().to_string());
        self.emit(
            MetricRecord::new("operation_duration", duration_ms, "ms", MetricCategory::Operation)
                .with_tags(tags.clone()),
        );
        for (name, value) in &completed.extra_metrics {
            self.emit(
                MetricRecord::new(name.clone(), *value, "", MetricCategory::Operation)
                    .with_tags(tags.clone()),
            );
        }

        let mut log = self.completed.lock();
        if log.len() >= self.config.operation_log_capacity {
            log.pop_front();
        }
        log.push_back(completed.clone());
        Some(completed)
    }

    /// Number of operations currently open
    pub fn active_operations(&self) -> usize {
        self.active.len()
    }

    /// Completed operations, oldest first
    pub fn completed_operations(&self) -> Vec<CompletedOperation> {
        self.completed.lock().iter().cloned().collect()
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Sample resources now and append to history
    pub fn capture_resource_snapshot(&self) -> ResourceSnapshot {
        let snapshot = self.sampler.sample();
        self.push_resource_snapshot(snapshot.clone());
        snapshot
    }

    /// Append an externally produced snapshot to history
    pub fn push_resource_snapshot(&self, snapshot: ResourceSnapshot) {
        self.collector.gauge("cpu_percent").set(snapshot.cpu_percent);
        self.collector
            .gauge("memory_percent")
            .set(snapshot.memory_percent);
        self.collector
            .gauge("available_memory_mb")
            .set(snapshot.available_memory_mb());

        self.emit(MetricRecord::new("cpu_percent", snapshot.cpu_percent, "percent", MetricCategory::Resource));
        self.emit(MetricRecord::new(
            "memory_percent",
            snapshot.memory_percent,
            "percent",
            MetricCategory::Resource,
        ));
        if let Some(load) = snapshot.load_average {
            self.emit(MetricRecord::new("load_average", load, "load", MetricCategory::Resource));
        }

        self.resources.lock().push(snapshot);
    }

    /// Summarise recently completed operations.
    ///
    /// Returns `None` when fewer than `min_operations` completed inside the
    /// performance window.
    pub fn capture_performance_snapshot(&self) -> Option<PerformanceSnapshot> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.performance_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = now - window;

        let snapshot = {
            let log = self.completed.lock();
            let recent: Vec<&CompletedOperation> =
                log.iter().filter(|op| op.ended_at >= cutoff).collect();
            if recent.len() < self.config.min_operations.max(1) {
                return None;
            }
            summarize(now, window, &recent)
        };

        for (name, value, unit) in [
            ("mean_duration_ms", snapshot.mean_duration_ms, "ms"),
            ("p95_duration_ms", snapshot.p95_duration_ms, "ms"),
            ("throughput", snapshot.throughput_ops_per_sec, "ops/s"),
            ("error_rate", snapshot.error_rate, "ratio"),
            ("cache_hit_rate", snapshot.cache_hit_rate, "ratio"),
            ("memory_efficiency", snapshot.memory_efficiency, "ops/MB"),
        ] {
            self.collector.gauge(name).set(value);
            self.emit(MetricRecord::new(name, value, unit, MetricCategory::Performance));
        }

        self.performance.lock().push(snapshot.clone());
        Some(snapshot)
    }

    /// Append an externally produced performance snapshot to history
    pub fn push_performance_snapshot(&self, snapshot: PerformanceSnapshot) {
        self.performance.lock().push(snapshot);
    }

    pub fn latest_resource_snapshot(&self) -> Option<ResourceSnapshot> {
        self.resources.lock().latest().cloned()
    }

    pub fn resource_history(&self) -> Vec<ResourceSnapshot> {
        self.resources.lock().to_vec()
    }

    pub fn performance_history(&self) -> Vec<PerformanceSnapshot> {
        self.performance.lock().to_vec()
    }

    // =========================================================================
    // Trends
    // =========================================================================

    /// Resource trend over the trailing `window`
    pub fn get_resource_trend(&self, window: Duration) -> ResourceTrend {
        let snapshots = self.resources.lock().since(cutoff_for(window));
        ResourceTrend::from_snapshots(window.as_secs(), &snapshots)
    }

    /// Performance trend over the trailing `window`
    pub fn get_performance_trend(&self, window: Duration) -> PerformanceTrend {
        let snapshots = self.performance.lock().since(cutoff_for(window));
        PerformanceTrend::from_snapshots(window.as_secs(), &snapshots)
    }

    // =========================================================================
    // Background sampling
    // =========================================================================

    /// Start periodic sampling. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        let started = self.background.start(self.config.sample_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(monitor) = weak.upgrade() {
                    monitor.sample_tick();
                }
            }
        });
        if started {
            info!(
                interval_ms = self.config.sample_interval.as_millis() as u64,
                "Performance monitor started"
            );
        }
        started
    }

    /// Stop periodic sampling. Returns `false` if not running.
    pub async fn stop(&self) -> bool {
        let stopped = self.background.stop(Duration::from_secs(5)).await;
        if stopped {
            self.sink.flush();
            info!("Performance monitor stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.background.is_running()
    }

    fn sample_tick(&self) {
        let resource = self.capture_resource_snapshot();
        let performance = self.capture_performance_snapshot();
        debug!(
            cpu = resource.cpu_percent,
            memory = resource.memory_percent,
            has_performance = performance.is_some(),
            "Monitor sample"
        );
    }
}

fn cutoff_for(window: Duration) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365));
    Utc::now() - window
}

fn summarize(
    now: DateTime<Utc>,
    window: chrono::Duration,
    ops: &[&CompletedOperation],
) -> PerformanceSnapshot {
    let count = ops.len();
    let mut durations: Vec<f64> = ops.iter().map(|op| op.duration_ms).collect();
    durations.sort_by(|a, b| a.total_cmp(b));

    let mean = durations.iter().sum::<f64>() / count as f64;
    let rank = ((count as f64 * 0.95).ceil() as usize).clamp(1, count);
    let p95 = durations[rank - 1];

    let earliest = ops
        .iter()
        .map(|op| op.started_at)
        .min()
        .unwrap_or(now);
    let span = (now - earliest).min(window);
    let span_secs = (span.num_milliseconds() as f64 / 1_000.0).max(0.001);

    let failed = ops.iter().filter(|op| !op.succeeded()).count();
    let hits: u64 = ops.iter().map(|op| op.cache_hits).sum();
    let misses: u64 = ops.iter().map(|op| op.cache_misses).sum();
    let memory_mb: f64 = ops
        .iter()
        .filter_map(|op| op.extra_metrics.get(MEMORY_MB_METRIC))
        .sum();

    PerformanceSnapshot {
        timestamp: now,
        operation_count: count,
        mean_duration_ms: mean,
        p95_duration_ms: p95,
        throughput_ops_per_sec: count as f64 / span_secs,
        error_rate: failed as f64 / count as f64,
        cache_hit_rate: if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        },
        memory_efficiency: if memory_mb > 0.0 {
            count as f64 / memory_mb
        } else {
            0.0
        },
    }
}

// =============================================================================
// Tests
// =============================================================================
