//! Trend Analysis
//!
//! A trend is the average, peak and direction of one metric over a window.
//! Direction is the Pearson correlation of the metric against its sample
//! index: a cheap slope-sign indicator in [-1, 1], not a regression.

use serde::{Deserialize, Serialize};

use super::snapshot::{PerformanceSnapshot, ResourceSnapshot};

/// Summary of one metric over a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub avg: f64,
    pub max: f64,
    /// Correlation against sample index, in [-1, 1]
    pub direction: f64,
    pub sample_count: usize,
}

impl TrendSummary {
    /// Summarise a series (oldest first)
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        Self {
            avg: values.iter().sum::<f64>() / n,
            max: values.iter().copied().fold(f64::MIN, f64::max),
            direction: index_correlation(values),
            sample_count: values.len(),
        }
    }

    /// Direction above `threshold`
    pub fn is_rising(&self, threshold: f64) -> bool {
        self.direction > threshold
    }

    /// Direction below `-threshold`
    pub fn is_falling(&self, threshold: f64) -> bool {
        self.direction < -threshold
    }
}

/// Pearson correlation of `values` against `0..n`.
///
/// Zero for fewer than two samples or a flat series.
pub fn index_correlation(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (i, &y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y <= f64::EPSILON {
        return 0.0;
    }
    (cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0)
}

/// Resource usage trend over a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTrend {
    pub window_secs: u64,
    pub sample_count: usize,
    pub cpu: TrendSummary,
    pub memory: TrendSummary,
    /// Most recent available memory in MiB
    pub available_memory_mb: f64,
}

impl ResourceTrend {
    /// Build from snapshots (oldest first)
    pub fn from_snapshots(window_secs: u64, snapshots: &[ResourceSnapshot]) -> Self {
        let cpu: Vec<f64> = snapshots.iter().map(|s| s.cpu_percent).collect();
        let memory: Vec<f64> = snapshots.iter().map(|s| s.memory_percent).collect();
        Self {
            window_secs,
            sample_count: snapshots.len(),
            cpu: TrendSummary::from_values(&cpu),
            memory: TrendSummary::from_values(&memory),
            available_memory_mb: snapshots
                .last()
                .map(|s| s.available_memory_mb())
                .unwrap_or(0.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// Operation performance trend over a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTrend {
    pub window_secs: u64,
    pub sample_count: usize,
    pub duration_ms: TrendSummary,
    pub throughput: TrendSummary,
    pub error_rate: TrendSummary,
    pub cache_hit_rate: TrendSummary,
}

impl PerformanceTrend {
    /// Build from snapshots (oldest first)
    pub fn from_snapshots(window_secs: u64, snapshots: &[PerformanceSnapshot]) -> Self {
        let series = |f: fn(&PerformanceSnapshot) -> f64| -> TrendSummary {
            let values: Vec<f64> = snapshots.iter().map(f).collect();
            TrendSummary::from_values(&values)
        };
        Self {
            window_secs,
            sample_count: snapshots.len(),
            duration_ms: series(|s| s.mean_duration_ms),
            throughput: series(|s| s.throughput_ops_per_sec),
            error_rate: series(|s| s.error_rate),
            cache_hit_rate: series(|s| s.cache_hit_rate),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_correlation_of_monotonic_series() {
        assert!((index_correlation(&[1.0, 2.0, 3.0, 4.0]) - 1.0).abs() < 1e-9);
        assert!((index_correlation(&[4.0, 3.0, 2.0, 1.0]) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_degenerate_cases() {
        assert_eq!(index_correlation(&[]), 0.0);
        assert_eq!(index_correlation(&[42.0]), 0.0);
        assert_eq!(index_correlation(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn test_summary() {
        let summary = TrendSummary::from_values(&[10.0, 30.0, 20.0, 40.0]);
        assert_eq!(summary.avg, 25.0);
        assert_eq!(summary.max, 40.0);
        assert_eq!(summary.sample_count, 4);
        assert!(summary.is_rising(0.1));
        assert!(!summary.is_falling(0.1));
    }

    #[test]
    fn test_empty_summary() {
        let summary = TrendSummary::from_values(&[]);
        assert_eq!(summary, TrendSummary::default());
    }

    proptest! {
        #[test]
        fn prop_correlation_is_bounded(values in proptest::collection::vec(-1e6f64..1e6, 0..64)) {
            let r = index_correlation(&values);
            prop_assert!((-1.0..=1.0).contains(&r));
        }
    }
}
