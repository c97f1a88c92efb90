//! Auto-Tuner control loop
//!
//! Each cycle samples the monitor, evaluates the recommendation rules and
//! applies the confident ones to their owning component. A cycle never
//! terminates the loop: apply failures are logged and counted, and a panic
//! inside a cycle is caught at the loop boundary.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::limits::{ProcessingLimits, SharedLimits};
use super::recommendation::{
    recommend, AppliedRecommendation, PerformanceTargets, TunedParameter, TunedValues,
    TuningRecommendation,
};
use crate::background::BackgroundLoop;
use crate::cache::CacheStore;
use crate::config::ensure;
use crate::error::Result;
use crate::monitoring::{
    MetricCategory, MetricRecord, PerformanceMonitor, PerformanceTrend, ResourceTrend,
};
use crate::pool::WorkerPool;

// =============================================================================
// Configuration
// =============================================================================

/// Auto-tuner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoTunerConfig {
    /// Control loop period
    #[serde(with = "crate::config::duration_serde")]
    pub interval: Duration,
    /// Recommendations at or above this confidence are applied
    pub confidence_threshold: f64,
    /// Cap on the applied-recommendation history
    pub history_capacity: usize,
    /// Trend window read each cycle
    #[serde(with = "crate::config::duration_serde")]
    pub trend_window: Duration,
    pub target_duration_ms: f64,
    /// Operations per second
    pub target_throughput: f64,
    pub initial_memory_pool_mb: u64,
    pub initial_streaming_threshold_mb: u64,
}

impl Default for AutoTunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            confidence_threshold: 0.7,
            history_capacity: 100,
            trend_window: Duration::from_secs(300),
            target_duration_ms: 1000.0,
            target_throughput: 1.0,
            initial_memory_pool_mb: 512,
            initial_streaming_threshold_mb: 100,
        }
    }
}

impl AutoTunerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure(!self.interval.is_zero(), || {
            "auto_tuner.interval must be > 0".to_string()
        })?;
        ensure((0.0..=1.0).contains(&self.confidence_threshold), || {
            format!(
                "auto_tuner.confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )
        })?;
        ensure(self.history_capacity > 0, || {
            "auto_tuner.history_capacity must be > 0".to_string()
        })?;
        ensure(self.target_duration_ms > 0.0, || {
            "auto_tuner.target_duration_ms must be > 0".to_string()
        })?;
        ensure(
            self.initial_memory_pool_mb > 0 && self.initial_streaming_threshold_mb > 0,
            || "auto_tuner initial limits must be > 0".to_string(),
        )?;
        Ok(())
    }

    pub fn initial_limits(&self) -> ProcessingLimits {
        ProcessingLimits {
            memory_pool_mb: self.initial_memory_pool_mb,
            streaming_threshold_mb: self.initial_streaming_threshold_mb,
        }
    }

    fn targets(&self) -> PerformanceTargets {
        PerformanceTargets {
            target_duration_ms: self.target_duration_ms,
            target_throughput: self.target_throughput,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Outcome of one cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    /// Every recommendation produced, applied or not
    pub recommendations: Vec<TuningRecommendation>,
    pub applied: Vec<AppliedRecommendation>,
    /// Confident recommendations whose apply step failed
    pub failed: usize,
}

/// Tuner status for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerStatus {
    pub active: bool,
    pub current_config: TunedValues,
    pub resource_trend: ResourceTrend,
    pub performance_trend: PerformanceTrend,
    pub recent_recommendation_count: usize,
    pub applied_count: usize,
    pub cycles: u64,
    pub failed_cycles: u64,
}

// =============================================================================
// Auto-Tuner
// =============================================================================

/// Periodic tuner of cache size, pool width and processing limits
pub struct AutoTuner {
    config: AutoTunerConfig,
    monitor: Arc<PerformanceMonitor>,
    cache: Arc<CacheStore>,
    pool: Arc<WorkerPool>,
    limits: SharedLimits,
    history: Mutex<VecDeque<AppliedRecommendation>>,
    recent: Mutex<Vec<TuningRecommendation>>,
    /// Serializes apply phases so two cycles never interleave
    apply_lock: tokio::sync::Mutex<()>,
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    background: BackgroundLoop,
}

impl AutoTuner {
    pub fn new(
        config: AutoTunerConfig,
        monitor: Arc<PerformanceMonitor>,
        cache: Arc<CacheStore>,
        pool: Arc<WorkerPool>,
        limits: SharedLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            recent: Mutex::new(Vec::new()),
            apply_lock: tokio::sync::Mutex::new(()),
            cycles: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
            background: BackgroundLoop::new("auto-tuner"),
            config,
            monitor,
            cache,
            pool,
            limits,
        })
    }

    pub fn config(&self) -> &AutoTunerConfig {
        &self.config
    }

    /// Handle to the processing limits this tuner adjusts
    pub fn limits(&self) -> SharedLimits {
        self.limits.clone()
    }

    fn current_values(&self) -> TunedValues {
        TunedValues::new(
            self.cache.max_bytes(),
            self.pool.worker_count(),
            self.limits.get(),
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the control loop. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        let started = self.background.start(self.config.interval, move || {
            let weak = weak.clone();
            async move {
                let Some(tuner) = weak.upgrade() else {
                    return;
                };
                let cycle = AssertUnwindSafe(tuner.run_cycle()).catch_unwind().await;
                if cycle.is_err() {
                    tuner.failed_cycles.fetch_add(1, Ordering::Relaxed);
                    error!("Auto-tuning cycle panicked, continuing with next cycle");
                }
            }
        });
        if started {
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                confidence_threshold = self.config.confidence_threshold,
                "Auto-tuner started"
            );
        }
        started
    }

    /// Stop the control loop. Returns `false` if not running.
    pub async fn stop(&self) -> bool {
        let stopped = self.background.stop(self.config.interval).await;
        if stopped {
            info!("Auto-tuner stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.background.is_running()
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Recommendations for the current trends, without sampling or applying
    pub fn manual_recommendation(&self) -> Vec<TuningRecommendation> {
        let resource = self.monitor.get_resource_trend(self.config.trend_window);
        let performance = self.monitor.get_performance_trend(self.config.trend_window);
        recommend(
            &resource,
            &performance,
            &self.current_values(),
            &self.config.targets(),
        )
    }

    /// Run one sample, recommend, apply cycle
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        self.monitor.capture_resource_snapshot();
        self.monitor.capture_performance_snapshot();

        let _apply = self.apply_lock.lock().await;
        let recommendations = self.manual_recommendation();
        let mut report = CycleReport {
            recommendations: recommendations.clone(),
            ..CycleReport::default()
        };

        for rec in recommendations {
            if rec.confidence < self.config.confidence_threshold {
                debug!(
                    parameter = %rec.parameter,
                    confidence = rec.confidence,
                    "Recommendation below confidence threshold, not applied"
                );
                continue;
            }
            match self.apply(&rec).await {
                Ok(applied_value) => {
                    info!(
                        parameter = %rec.parameter,
                        from = rec.current_value,
                        to = applied_value,
                        confidence = rec.confidence,
                        reason = %rec.reason,
                        "Applied tuning recommendation"
                    );
                    self.monitor.emit_metric(
                        MetricRecord::new(
                            "tuning_applied",
                            applied_value,
                            "",
                            MetricCategory::Tuner,
                        )
                        .with_tag("parameter", rec.parameter.as_str()),
                    );
                    report.applied.push(AppliedRecommendation {
                        recommendation: rec,
                        applied_value,
                        applied_at: Utc::now(),
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(parameter = %rec.parameter, error = %e, "Failed to apply tuning recommendation");
                }
            }
        }

        self.record_history(&report.applied);
        *self.recent.lock() = report.recommendations.clone();
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if report.failed > 0 {
            self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            generated = report.recommendations.len(),
            applied = report.applied.len(),
            failed = report.failed,
            "Auto-tuning cycle complete"
        );
        report
    }

    /// Apply one recommendation to its owner, returning the value in effect
    async fn apply(&self, rec: &TuningRecommendation) -> Result<f64> {
        let value = rec.recommended_value.max(0.0);
        match rec.parameter {
            TunedParameter::CacheMaxBytes => {
                let applied = self.cache.set_max_bytes(value as u64).await?;
                Ok(applied as f64)
            }
            TunedParameter::WorkerCount => {
                let applied = self.pool.resize(value as usize).await?;
                Ok(applied as f64)
            }
            TunedParameter::MemoryPoolMb => {
                let limits = self.limits.update(|l| l.memory_pool_mb = value as u64);
                Ok(limits.memory_pool_mb as f64)
            }
            TunedParameter::StreamingThresholdMb => {
                let limits = self.limits.update(|l| l.streaming_threshold_mb = value as u64);
                Ok(limits.streaming_threshold_mb as f64)
            }
        }
    }

    fn record_history(&self, applied: &[AppliedRecommendation]) {
        let mut history = self.history.lock();
        for entry in applied {
            if history.len() >= self.config.history_capacity {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }
    }

    // =========================================================================
    // History & status
    // =========================================================================

    /// Applied recommendations, oldest first
    pub fn history(&self) -> Vec<AppliedRecommendation> {
        self.history.lock().iter().cloned().collect()
    }

    /// Write the applied history to `path` as JSON. Returns the entry count.
    pub async fn export_history(&self, path: impl AsRef<Path>) -> Result<usize> {
        let history = self.history();
        let doc = serde_json::to_vec_pretty(&history)?;
        tokio::fs::write(path.as_ref(), doc).await?;
        info!(path = %path.as_ref().display(), entries = history.len(), "Exported tuning history");
        Ok(history.len())
    }

    pub fn status(&self) -> TunerStatus {
        TunerStatus {
            active: self.is_running(),
            current_config: self.current_values(),
            resource_trend: self.monitor.get_resource_trend(self.config.trend_window),
            performance_trend: self.monitor.get_performance_trend(self.config.trend_window),
            recent_recommendation_count: self.recent.lock().len(),
            applied_count: self.history.lock().len(),
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::monitoring::{InMemoryMetricSink, MonitorConfig, PerformanceSnapshot, ScriptedSampler};
    use crate::pool::{PoolState, WorkerPoolConfig};

    struct Fixture {
        dir: tempfile::TempDir,
        monitor: Arc<PerformanceMonitor>,
        cache: Arc<CacheStore>,
        pool: Arc<WorkerPool>,
        tuner: Arc<AutoTuner>,
    }

    async fn fixture(readings: &[(f64, f64)], config: AutoTunerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let monitor = PerformanceMonitor::new(
            MonitorConfig::default(),
            Arc::new(ScriptedSampler::new(readings).with_host(4, 64 * 1024 * 1024 * 1024)),
            Arc::new(InMemoryMetricSink::default()),
        );
        let mut cache_config = CacheConfig::with_dir(dir.path());
        cache_config.max_bytes = 100 * 1024 * 1024;
        let cache = Arc::new(CacheStore::open(cache_config).await.unwrap());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                resize_cooldown: Duration::ZERO,
                ..WorkerPoolConfig::default()
            },
            monitor.clone(),
        );
        let tuner = AutoTuner::new(
            config.clone(),
            monitor.clone(),
            cache.clone(),
            pool.clone(),
            SharedLimits::new(config.initial_limits()),
        );
        Fixture {
            dir,
            monitor,
            cache,
            pool,
            tuner,
        }
    }

    fn perf(duration_ms: f64, throughput: f64, error_rate: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            timestamp: Utc::now(),
            operation_count: 10,
            mean_duration_ms: duration_ms,
            p95_duration_ms: duration_ms,
            throughput_ops_per_sec: throughput,
            error_rate,
            cache_hit_rate: 0.5,
            memory_efficiency: 0.0,
        }
    }

    #[test]
    fn test_config_validation() {
        AutoTunerConfig::default().validate().unwrap();
        let bad = AutoTunerConfig {
            confidence_threshold: 1.5,
            ..AutoTunerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_cycle_applies_confident_recommendations() {
        let f = fixture(&[(50.0, 86.0), (50.0, 90.0), (50.0, 95.0)], AutoTunerConfig::default()).await;
        f.monitor.capture_resource_snapshot();
        f.monitor.capture_resource_snapshot();

        let report = f.tuner.run_cycle().await;
        let applied: Vec<TunedParameter> = report
            .applied
            .iter()
            .map(|a| a.recommendation.parameter)
            .collect();
        assert!(applied.contains(&TunedParameter::CacheMaxBytes));
        assert!(applied.contains(&TunedParameter::MemoryPoolMb));
        assert_eq!(report.failed, 0);

        assert_eq!(f.cache.max_bytes(), 80 * 1024 * 1024);
        assert!(f.tuner.limits().get().memory_pool_mb < 512);
        assert_eq!(f.tuner.history().len(), report.applied.len());
    }

    #[tokio::test]
    async fn test_low_confidence_is_returned_but_never_applied() {
        let f = fixture(&[(60.0, 30.0)], AutoTunerConfig::default()).await;
        f.monitor.capture_resource_snapshot();
        f.monitor.push_performance_snapshot(perf(100.0, 50.0, 0.0));

        let manual = f.tuner.manual_recommendation();
        let grow = manual
            .iter()
            .find(|r| r.parameter == TunedParameter::CacheMaxBytes)
            .unwrap();
        assert_eq!(grow.confidence, 0.6);

        let report = f.tuner.run_cycle().await;
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.parameter == TunedParameter::CacheMaxBytes));
        assert!(report.applied.is_empty());
        assert!(f.tuner.history().is_empty());
        assert_eq!(f.cache.max_bytes(), 100 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_manual_recommendation_has_no_side_effects() {
        let f = fixture(&[(50.0, 86.0), (50.0, 95.0)], AutoTunerConfig::default()).await;
        f.monitor.capture_resource_snapshot();
        f.monitor.capture_resource_snapshot();

        assert!(!f.tuner.manual_recommendation().is_empty());
        assert_eq!(f.monitor.resource_history().len(), 2);
        assert_eq!(f.cache.max_bytes(), 100 * 1024 * 1024);
        assert!(f.tuner.history().is_empty());
    }

    #[tokio::test]
    async fn test_worker_recommendation_resizes_pool() {
        let f = fixture(&[(20.0, 70.0)], AutoTunerConfig::default()).await;
        f.pool.start().await.unwrap();
        f.monitor.push_performance_snapshot(perf(2500.0, 0.5, 0.0));

        let before = f.pool.worker_count();
        let report = f.tuner.run_cycle().await;
        assert!(report
            .applied
            .iter()
            .any(|a| a.recommendation.parameter == TunedParameter::WorkerCount));
        assert!(f.pool.worker_count() > before);
    }

    #[tokio::test]
    async fn test_stop_during_worker_resize_leaves_pool_usable() {
        let config = AutoTunerConfig {
            interval: Duration::from_millis(20),
            ..AutoTunerConfig::default()
        };
        // cpu inside the pool's own keep band, so only the tuner resizes
        let f = fixture(&[(35.0, 70.0)], config).await;
        let before = f.pool.start().await.unwrap();
        f.monitor.push_performance_snapshot(perf(2500.0, 0.5, 0.0));

        // holds one worker so the resize drain cannot finish
        let busy = f.pool.submit(|| {
            std::thread::sleep(Duration::from_millis(400));
            Ok::<_, String>(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(f.tuner.start());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.pool.state(), PoolState::Resizing);

        assert!(f.tuner.stop().await);
        assert!(!f.tuner.is_running());
        assert_eq!(f.pool.state(), PoolState::Running);
        assert_eq!(f.pool.worker_count(), before);

        busy.await.unwrap();
        assert_eq!(f.pool.resize(before + 1).await.unwrap(), before + 1);
        assert_eq!(f.pool.state(), PoolState::Running);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_exported() {
        let config = AutoTunerConfig {
            history_capacity: 2,
            ..AutoTunerConfig::default()
        };
        let f = fixture(&[(50.0, 86.0), (50.0, 90.0), (50.0, 95.0), (50.0, 99.0)], config).await;
        f.monitor.capture_resource_snapshot();
        for _ in 0..3 {
            f.tuner.run_cycle().await;
        }
        assert_eq!(f.tuner.history().len(), 2);

        let path = f.dir.path().join("history.json");
        assert_eq!(f.tuner.export_history(&path).await.unwrap(), 2);
        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<AppliedRecommendation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let config = AutoTunerConfig {
            interval: Duration::from_millis(10),
            ..AutoTunerConfig::default()
        };
        let f = fixture(&[(60.0, 60.0)], config).await;

        assert!(f.tuner.start());
        assert!(!f.tuner.start());
        assert!(f.tuner.status().active);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(f.tuner.stop().await);
        assert!(!f.tuner.stop().await);

        let status = f.tuner.status();
        assert!(!status.active);
        assert!(status.cycles >= 1);
    }
}
