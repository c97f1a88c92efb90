//! Pool Sizing
//!
//! Pure sizing rules: the initial worker count and the resize decision.
//! Every result is clamped to `[min_workers, max_workers]`.

use super::config::WorkerPoolConfig;

/// CPU usage above which the pool is considered saturated
pub const CPU_HIGH_PCT: f64 = 90.0;
/// CPU usage below which the pool is considered oversized
pub const CPU_LOW_PCT: f64 = 30.0;
/// Latency direction above which latency counts as degrading
pub const LATENCY_DEGRADING: f64 = 0.1;

const MB: u64 = 1024 * 1024;

/// Initial worker count from workload class, cores and available memory
pub fn initial_worker_count(
    config: &WorkerPoolConfig,
    cpu_count: usize,
    available_memory_bytes: u64,
) -> usize {
    let by_cpu = cpu_count.max(1) * config.workload.workers_per_core();
    let by_memory = (available_memory_bytes / (config.memory_per_worker_mb.max(1) * MB)) as usize;
    config.clamp(by_cpu.min(by_memory.max(1)))
}

/// Observations a resize decision is made from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeInputs {
    pub current_workers: usize,
    /// Average CPU over the trend window
    pub cpu_percent: f64,
    /// Average memory over the trend window
    pub memory_percent: f64,
    /// Direction of operation latency over the trend window
    pub latency_direction: f64,
}

/// Outcome of a resize evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ResizeDecision {
    Keep,
    Resize { target: usize, reason: String },
}

impl ResizeDecision {
    pub fn target(&self) -> Option<usize> {
        match self {
            ResizeDecision::Keep => None,
            ResizeDecision::Resize { target, .. } => Some(*target),
        }
    }
}

/// Step size for one resize: a quarter of the pool, at least one worker
pub fn resize_step(current: usize) -> usize {
    (current / 4).max(1)
}

/// Decide whether the pool should grow or shrink.
///
/// - memory above the limit: shrink
/// - CPU saturated with latency degrading and room to grow: grow
/// - CPU saturated otherwise: shrink to cut contention
/// - CPU idle: shrink
pub fn decide_resize(config: &WorkerPoolConfig, inputs: &ResizeInputs) -> ResizeDecision {
    let current = config.clamp(inputs.current_workers);
    let step = resize_step(current);
    let shrink = config.clamp(current.saturating_sub(step));
    let grow = config.clamp(current.saturating_add(step));

    let (target, reason) = if inputs.memory_percent > config.memory_limit_pct {
        (
            shrink,
            format!(
                "memory {:.1}% above limit {:.1}%",
                inputs.memory_percent, config.memory_limit_pct
            ),
        )
    } else if inputs.cpu_percent > CPU_HIGH_PCT {
        if current < config.max_workers && inputs.latency_direction > LATENCY_DEGRADING {
            (
                grow,
                format!(
                    "cpu {:.1}% with latency degrading ({:.2})",
                    inputs.cpu_percent, inputs.latency_direction
                ),
            )
        } else {
            (shrink, format!("cpu {:.1}% saturated", inputs.cpu_percent))
        }
    } else if inputs.cpu_percent < CPU_LOW_PCT {
        (shrink, format!("cpu {:.1}% underused", inputs.cpu_percent))
    } else {
        return ResizeDecision::Keep;
    };

    if target == inputs.current_workers {
        ResizeDecision::Keep
    } else {
        ResizeDecision::Resize { target, reason }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkloadClass;
    use proptest::prelude::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn config(min: usize, max: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: min,
            max_workers: max,
            ..WorkerPoolConfig::default()
        }
    }

    fn inputs(current: usize, cpu: f64, memory: f64, latency: f64) -> ResizeInputs {
        ResizeInputs {
            current_workers: current,
            cpu_percent: cpu,
            memory_percent: memory,
            latency_direction: latency,
        }
    }

    // =========================================================================
    // Initial size
    // =========================================================================

    #[test]
    fn test_initial_size_by_workload() {
        let mut cfg = config(1, 64);
        cfg.workload = WorkloadClass::CpuBound;
        assert_eq!(initial_worker_count(&cfg, 8, 64 * GB), 8);
        cfg.workload = WorkloadClass::Mixed;
        assert_eq!(initial_worker_count(&cfg, 8, 64 * GB), 16);
        cfg.workload = WorkloadClass::IoBound;
        assert_eq!(initial_worker_count(&cfg, 8, 64 * GB), 32);
    }

    #[test]
    fn test_initial_size_limited_by_memory_and_bounds() {
        let mut cfg = config(2, 64);
        cfg.workload = WorkloadClass::IoBound;
        // 500 MiB / 100 MiB per worker = 5
        assert_eq!(initial_worker_count(&cfg, 8, 500 * MB), 5);
        // no memory still yields min_workers
        assert_eq!(initial_worker_count(&cfg, 8, 0), 2);
        // capped by max
        assert_eq!(initial_worker_count(&config(1, 4), 16, 64 * GB), 4);
    }

    // =========================================================================
    // Resize decisions
    // =========================================================================

    #[test]
    fn test_memory_pressure_shrinks() {
        let decision = decide_resize(&config(1, 32), &inputs(8, 50.0, 95.0, 0.0));
        assert_eq!(decision.target(), Some(6));
    }

    #[test]
    fn test_cpu_saturated_with_degrading_latency_grows() {
        let decision = decide_resize(&config(1, 32), &inputs(8, 95.0, 40.0, 0.8));
        assert_eq!(decision.target(), Some(10));
    }

    #[test]
    fn test_cpu_saturated_without_latency_signal_shrinks() {
        let decision = decide_resize(&config(1, 32), &inputs(8, 95.0, 40.0, 0.0));
        assert_eq!(decision.target(), Some(6));
    }

    #[test]
    fn test_cpu_saturated_at_max_shrinks() {
        let decision = decide_resize(&config(1, 8), &inputs(8, 95.0, 40.0, 0.9));
        assert_eq!(decision.target(), Some(6));
    }

    #[test]
    fn test_idle_cpu_shrinks_until_min() {
        assert_eq!(decide_resize(&config(2, 32), &inputs(3, 5.0, 40.0, 0.0)).target(), Some(2));
        assert_eq!(decide_resize(&config(2, 32), &inputs(2, 5.0, 40.0, 0.0)), ResizeDecision::Keep);
    }

    #[test]
    fn test_moderate_load_keeps() {
        assert_eq!(decide_resize(&config(1, 32), &inputs(8, 60.0, 60.0, 0.5)), ResizeDecision::Keep);
    }

    proptest! {
        #[test]
        fn prop_resize_target_within_bounds(
            min in 1usize..16,
            span in 0usize..48,
            current in 0usize..128,
            cpu in -50.0f64..250.0,
            memory in -50.0f64..250.0,
            latency in -2.0f64..2.0,
        ) {
            let cfg = config(min, min + span);
            if let Some(target) = decide_resize(&cfg, &inputs(current, cpu, memory, latency)).target() {
                prop_assert!(target >= cfg.min_workers && target <= cfg.max_workers);
            }
        }

        #[test]
        fn prop_initial_size_within_bounds(
            min in 1usize..16,
            span in 0usize..48,
            cores in 0usize..256,
            memory_mb in 0u64..1_000_000,
        ) {
            let cfg = config(min, min + span);
            let n = initial_worker_count(&cfg, cores, memory_mb * MB);
            prop_assert!(n >= cfg.min_workers && n <= cfg.max_workers);
        }
    }
}
