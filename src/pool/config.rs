//! Worker pool configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ensure;
use crate::error::{Error, Result};

/// Coarse hint used to pick the initial pool size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadClass {
    /// One worker per core
    CpuBound,
    /// Four workers per core
    IoBound,
    /// Two workers per core
    #[default]
    Mixed,
}

impl WorkloadClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::CpuBound => "cpu-bound",
            WorkloadClass::IoBound => "io-bound",
            WorkloadClass::Mixed => "mixed",
        }
    }

    /// Workers per CPU core
    pub fn workers_per_core(&self) -> usize {
        match self {
            WorkloadClass::CpuBound => 1,
            WorkloadClass::IoBound => 4,
            WorkloadClass::Mixed => 2,
        }
    }
}

impl std::fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "cpu-bound" | "cpu" => Ok(WorkloadClass::CpuBound),
            "io-bound" | "io" => Ok(WorkloadClass::IoBound),
            "mixed" => Ok(WorkloadClass::Mixed),
            other => Err(Error::validation(
                "workload",
                format!("unknown workload class '{}'", other),
            )),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub workload: WorkloadClass,
    /// Memory budget per worker used for initial sizing
    pub memory_per_worker_mb: u64,
    /// Shrink when memory usage exceeds this percentage
    pub memory_limit_pct: f64,
    /// Minimum time between automatic resizes
    #[serde(with = "crate::config::duration_serde")]
    pub resize_cooldown: Duration,
    /// How long `shutdown(true)` waits for in-flight work
    #[serde(with = "crate::config::duration_serde")]
    pub shutdown_timeout: Duration,
    /// Window of monitor trends consulted for resize decisions
    #[serde(with = "crate::config::duration_serde")]
    pub trend_window: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 32,
            workload: WorkloadClass::Mixed,
            memory_per_worker_mb: 100,
            memory_limit_pct: 85.0,
            resize_cooldown: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            trend_window: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<()> {
        ensure(self.min_workers >= 1, || {
            "worker_pool.min_workers must be >= 1".to_string()
        })?;
        ensure(self.min_workers <= self.max_workers, || {
            format!(
                "worker_pool.min_workers ({}) must not exceed max_workers ({})",
                self.min_workers, self.max_workers
            )
        })?;
        ensure(self.memory_per_worker_mb > 0, || {
            "worker_pool.memory_per_worker_mb must be > 0".to_string()
        })?;
        ensure(
            self.memory_limit_pct > 0.0 && self.memory_limit_pct <= 100.0,
            || "worker_pool.memory_limit_pct must be in (0, 100]".to_string(),
        )?;
        Ok(())
    }

    /// Clamp a worker count to `[min_workers, max_workers]`
    pub fn clamp(&self, workers: usize) -> usize {
        workers.clamp(self.min_workers, self.max_workers.max(self.min_workers))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_parse_and_serde() {
        assert_eq!("cpu-bound".parse::<WorkloadClass>().unwrap(), WorkloadClass::CpuBound);
        assert_eq!("IO_BOUND".parse::<WorkloadClass>().unwrap(), WorkloadClass::IoBound);
        assert!("gpu".parse::<WorkloadClass>().is_err());

        let json = serde_json::to_string(&WorkloadClass::IoBound).unwrap();
        assert_eq!(json, "\"io-bound\"");
    }

    #[test]
    fn test_validate() {
        WorkerPoolConfig::default().validate().unwrap();

        let inverted = WorkerPoolConfig {
            min_workers: 8,
            max_workers: 2,
            ..WorkerPoolConfig::default()
        };
        assert!(inverted.validate().is_err());

        let zero = WorkerPoolConfig {
            min_workers: 0,
            ..WorkerPoolConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_clamp() {
        let config = WorkerPoolConfig {
            min_workers: 2,
            max_workers: 6,
            ..WorkerPoolConfig::default()
        };
        assert_eq!(config.clamp(0), 2);
        assert_eq!(config.clamp(4), 4);
        assert_eq!(config.clamp(100), 6);
    }
}
