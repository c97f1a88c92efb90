//! Resource Sampling

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use super::snapshot::ResourceSnapshot;

/// Source of resource snapshots
pub trait ResourceSampler: Send + Sync {
    /// Sample current resource usage; must not block for long
    fn sample(&self) -> ResourceSnapshot;
}

/// Production sampler backed by `sysinfo`.
///
/// Keeps one `System` alive so CPU usage is measured as the delta between
/// consecutive samples, which avoids sleeping inside `sample`.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        // prime the CPU counters so the first real sample has a baseline
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self) -> ResourceSnapshot {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let total = system.total_memory();
        let available = system.available_memory();
        let memory_percent = if total > 0 {
            (total.saturating_sub(available)) as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let cpu_count = match system.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };

        let load = System::load_average();
        let load_average = if load.one > 0.0 { Some(load.one) } else { None };

        ResourceSnapshot {
            timestamp: Utc::now(),
            cpu_percent: (system.global_cpu_info().cpu_usage() as f64).clamp(0.0, 100.0),
            memory_percent,
            available_memory_bytes: available,
            cpu_count,
            load_average,
            io_wait: None,
        }
    }
}

/// Replays a fixed sequence of `(cpu_percent, memory_percent)` readings,
/// repeating the last one once exhausted. For tests and dry runs.
pub struct ScriptedSampler {
    readings: Mutex<VecDeque<(f64, f64)>>,
    last: Mutex<(f64, f64)>,
    cpu_count: usize,
    available_memory_bytes: u64,
}

impl ScriptedSampler {
    pub fn new(readings: &[(f64, f64)]) -> Self {
        Self {
            readings: Mutex::new(readings.iter().copied().collect()),
            last: Mutex::new(readings.first().copied().unwrap_or((0.0, 0.0))),
            cpu_count: 8,
            available_memory_bytes: 8 * 1024 * 1024 * 1024,
        }
    }

    /// Override the reported core count and available memory
    pub fn with_host(mut self, cpu_count: usize, available_memory_bytes: u64) -> Self {
        self.cpu_count = cpu_count.max(1);
        self.available_memory_bytes = available_memory_bytes;
        self
    }

    /// Queue more readings
    pub fn push(&self, cpu_percent: f64, memory_percent: f64) {
        self.readings.lock().push_back((cpu_percent, memory_percent));
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&self) -> ResourceSnapshot {
        let next = self.readings.lock().pop_front();
        let (cpu_percent, memory_percent) = {
            let mut last = self.last.lock();
            if let Some(reading) = next {
                *last = reading;
            }
            *last
        };
        ResourceSnapshot {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            available_memory_bytes: self.available_memory_bytes,
            cpu_count: self.cpu_count,
            load_average: None,
            io_wait: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
