//! Tuning Recommendations
//!
//! The recommendation rules are pure functions of the observed trends and
//! the current tunable values. Each rule carries a fixed confidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::limits::ProcessingLimits;
use crate::monitoring::{PerformanceTrend, ResourceTrend};
use crate::pool::resize_step;

/// Direction above which a trend counts as rising
pub const RISING_DIRECTION: f64 = 0.1;

pub const MEMORY_HIGH_PCT: f64 = 85.0;
pub const MEMORY_LOW_PCT: f64 = 50.0;
pub const CPU_HIGH_PCT: f64 = 80.0;
pub const CPU_LOW_PCT: f64 = 40.0;
pub const ERROR_RATE_HIGH: f64 = 0.1;
/// CPU and memory ceilings under which slow operations count as underutilised
pub const IDLE_CPU_PCT: f64 = 50.0;
pub const IDLE_MEMORY_PCT: f64 = 60.0;

/// Component owning a tunable parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunedComponent {
    Cache,
    WorkerPool,
    Processing,
}

/// A tunable parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunedParameter {
    CacheMaxBytes,
    WorkerCount,
    MemoryPoolMb,
    StreamingThresholdMb,
}

impl TunedParameter {
    pub fn component(&self) -> TunedComponent {
        match self {
            TunedParameter::CacheMaxBytes => TunedComponent::Cache,
            TunedParameter::WorkerCount => TunedComponent::WorkerPool,
            TunedParameter::MemoryPoolMb | TunedParameter::StreamingThresholdMb => {
                TunedComponent::Processing
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunedParameter::CacheMaxBytes => "cache_max_bytes",
            TunedParameter::WorkerCount => "worker_count",
            TunedParameter::MemoryPoolMb => "memory_pool_mb",
            TunedParameter::StreamingThresholdMb => "streaming_threshold_mb",
        }
    }
}

impl std::fmt::Display for TunedParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One suggested parameter change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRecommendation {
    pub component: TunedComponent,
    pub parameter: TunedParameter,
    pub current_value: f64,
    pub recommended_value: f64,
    /// Fixed per rule, in [0, 1]
    pub confidence: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl TuningRecommendation {
    fn new(
        parameter: TunedParameter,
        current_value: f64,
        recommended_value: f64,
        confidence: f64,
        reason: String,
    ) -> Self {
        Self {
            component: parameter.component(),
            parameter,
            current_value,
            recommended_value,
            confidence,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// A recommendation that was applied, with the value actually in effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRecommendation {
    pub recommendation: TuningRecommendation,
    /// Value after clamping by the owning component
    pub applied_value: f64,
    pub applied_at: DateTime<Utc>,
}

/// Current values of every tunable parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TunedValues {
    pub cache_max_bytes: u64,
    /// 0 while the pool has not started
    pub worker_count: usize,
    pub memory_pool_mb: u64,
    pub streaming_threshold_mb: u64,
}

impl TunedValues {
    pub fn new(cache_max_bytes: u64, worker_count: usize, limits: ProcessingLimits) -> Self {
        Self {
            cache_max_bytes,
            worker_count,
            memory_pool_mb: limits.memory_pool_mb,
            streaming_threshold_mb: limits.streaming_threshold_mb,
        }
    }
}

/// Thresholds the performance rules compare against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceTargets {
    /// Operations slower than this on average are "slow"
    pub target_duration_ms: f64,
    /// Throughput at or above this is "good"
    pub target_throughput: f64,
}

/// Evaluate every rule against the observed trends.
///
/// Resource rules need at least one resource sample and performance rules
/// at least one performance snapshot; rules without data stay silent.
pub fn recommend(
    resource: &ResourceTrend,
    performance: &PerformanceTrend,
    current: &TunedValues,
    targets: &PerformanceTargets,
) -> Vec<TuningRecommendation> {
    let mut out = Vec::new();
    let has_resource = !resource.is_empty();
    let has_performance = !performance.is_empty();

    let memory = resource.memory.avg;
    let cpu = resource.cpu.avg;
    let duration = performance.duration_ms.avg;
    let throughput = performance.throughput.avg;
    let cache_bytes = current.cache_max_bytes as f64;
    let memory_pool = current.memory_pool_mb as f64;
    let streaming = current.streaming_threshold_mb as f64;

    // memory
    if has_resource && memory > MEMORY_HIGH_PCT && resource.memory.is_rising(RISING_DIRECTION) {
        let reason = format!(
            "memory {:.1}% and rising ({:.2})",
            memory, resource.memory.direction
        );
        out.push(TuningRecommendation::new(
            TunedParameter::CacheMaxBytes,
            cache_bytes,
            (cache_bytes * 0.8).floor(),
            0.8,
            reason.clone(),
        ));
        out.push(TuningRecommendation::new(
            TunedParameter::MemoryPoolMb,
            memory_pool,
            (memory_pool * 0.8).floor(),
            0.7,
            reason,
        ));
    } else if has_resource
        && has_performance
        && memory < MEMORY_LOW_PCT
        && throughput >= targets.target_throughput
    {
        out.push(TuningRecommendation::new(
            TunedParameter::CacheMaxBytes,
            cache_bytes,
            (cache_bytes * 1.2).floor(),
            0.6,
            format!(
                "memory {:.1}% with throughput {:.2} ops/s",
                memory, throughput
            ),
        ));
    }

    // workers
    if current.worker_count > 0 && has_resource {
        let workers = current.worker_count;
        let step = resize_step(workers);
        if cpu > CPU_HIGH_PCT && resource.cpu.is_rising(RISING_DIRECTION) {
            out.push(TuningRecommendation::new(
                TunedParameter::WorkerCount,
                workers as f64,
                workers.saturating_sub(step) as f64,
                0.8,
                format!("cpu {:.1}% and rising ({:.2})", cpu, resource.cpu.direction),
            ));
        } else if has_performance && cpu < CPU_LOW_PCT && duration > targets.target_duration_ms {
            out.push(TuningRecommendation::new(
                TunedParameter::WorkerCount,
                workers as f64,
                (workers + step) as f64,
                0.7,
                format!(
                    "cpu {:.1}% with mean duration {:.0}ms over target {:.0}ms",
                    cpu, duration, targets.target_duration_ms
                ),
            ));
        }
    }

    // streaming threshold
    if has_performance {
        let error_rate = performance.error_rate.avg;
        if error_rate > ERROR_RATE_HIGH {
            out.push(TuningRecommendation::new(
                TunedParameter::StreamingThresholdMb,
                streaming,
                (streaming * 1.5).ceil(),
                0.6,
                format!("error rate {:.1}%", error_rate * 100.0),
            ));
        } else if has_resource
            && duration > targets.target_duration_ms
            && cpu < IDLE_CPU_PCT
            && memory < IDLE_MEMORY_PCT
        {
            out.push(TuningRecommendation::new(
                TunedParameter::StreamingThresholdMb,
                streaming,
                (streaming * 0.75).floor().max(1.0),
                0.7,
                format!(
                    "mean duration {:.0}ms with cpu {:.1}% and memory {:.1}%",
                    duration, cpu, memory
                ),
            ));
        }
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
