//! Composition Root
//!
//! [`OptimizationLayer`] builds every component from one [`OptimizerConfig`]
//! and injects them into each other explicitly. Core components never reach
//! for process-wide state; only the outermost integration code may install
//! a layer globally through [`install_global`] and fetch it with [`global`].

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{CacheStats, CacheStore};
use crate::config::OptimizerConfig;
use crate::error::{Error, Result};
use crate::monitoring::{HealthCheck, HealthCheckResult, HealthResponse, PerformanceMonitor};
use crate::pool::{PoolState, PoolStats, WorkerPool};
use crate::precompute::{PrecomputeEngine, PrecomputeStatus};
use crate::tuner::{AutoTuner, SharedLimits, TunerStatus};

/// Cache utilisation at which health degrades
const CACHE_DEGRADED_PCT: f64 = 95.0;
const CACHE_UNHEALTHY_PCT: f64 = 100.0;
const MEMORY_DEGRADED_PCT: f64 = 85.0;
const MEMORY_UNHEALTHY_PCT: f64 = 95.0;

static GLOBAL: OnceCell<Arc<OptimizationLayer>> = OnceCell::new();

/// Combined component status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStatus {
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub tuner: TunerStatus,
    pub precompute: PrecomputeStatus,
}

/// Every component of the performance layer, wired together
pub struct OptimizationLayer {
    config: OptimizerConfig,
    cache: Arc<CacheStore>,
    monitor: Arc<PerformanceMonitor>,
    pool: Arc<WorkerPool>,
    tuner: Arc<AutoTuner>,
    precompute: Arc<PrecomputeEngine>,
    health: HealthCheck,
}

impl OptimizationLayer {
    /// Build the layer with a host-sampling monitor
    pub async fn new(config: OptimizerConfig) -> Result<Arc<Self>> {
        let monitor = PerformanceMonitor::with_system_sampler(config.monitor.clone());
        Self::with_monitor(config, monitor).await
    }

    /// Build the layer around an existing monitor
    pub async fn with_monitor(
        config: OptimizerConfig,
        monitor: Arc<PerformanceMonitor>,
    ) -> Result<Arc<Self>> {
        let started = Instant::now();
        config.validate()?;

        let cache = Arc::new(CacheStore::open(config.cache.clone()).await?);
        let pool = WorkerPool::new(config.worker_pool.clone(), monitor.clone());
        let tuner = AutoTuner::new(
            config.auto_tuner.clone(),
            monitor.clone(),
            cache.clone(),
            pool.clone(),
            SharedLimits::new(config.auto_tuner.initial_limits()),
        );
        let precompute = PrecomputeEngine::open(
            config.precompute.clone(),
            cache.clone(),
            pool.clone(),
            monitor.clone(),
        )
        .await;

        info!(
            cache_dir = %cache.cache_dir().display(),
            workload = %config.worker_pool.workload,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Optimization layer initialized"
        );

        Ok(Arc::new(Self {
            config,
            cache,
            monitor,
            pool,
            tuner,
            precompute,
            health: HealthCheck::new(),
        }))
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn tuner(&self) -> &Arc<AutoTuner> {
        &self.tuner
    }

    pub fn precompute(&self) -> &Arc<PrecomputeEngine> {
        &self.precompute
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the pool and every background loop
    pub async fn start(&self) -> Result<()> {
        self.monitor.capture_resource_snapshot();
        self.pool.start().await?;
        self.monitor.start();
        self.tuner.start();
        self.precompute.start();
        self.health.set_ready(true);
        info!("Optimization layer started");
        Ok(())
    }

    /// Stop background loops, drain the pool and persist state
    pub async fn shutdown(&self) -> Result<()> {
        self.health.set_ready(false);
        self.tuner.stop().await;
        self.precompute.stop().await;
        self.monitor.stop().await;
        self.pool.shutdown(true).await;
        if let Err(e) = self.precompute.save_usage().await {
            warn!(error = %e, "Failed to persist usage state during shutdown");
        }
        self.cache.flush().await?;
        self.health.set_live(false);
        info!("Optimization layer shut down");
        Ok(())
    }

    // =========================================================================
    // Health & status
    // =========================================================================

    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    pub fn is_live(&self) -> bool {
        self.health.is_live()
    }

    /// Liveness, readiness and per-component checks
    pub fn health(&self) -> HealthResponse {
        let mut checks = Vec::new();

        let cache = self.cache.stats();
        checks.push(HealthCheckResult::from_percentage(
            "cache_utilization",
            cache.utilization_pct,
            CACHE_DEGRADED_PCT,
            CACHE_UNHEALTHY_PCT,
        ));

        if let Some(snapshot) = self.monitor.latest_resource_snapshot() {
            checks.push(HealthCheckResult::from_percentage(
                "memory",
                snapshot.memory_percent,
                MEMORY_DEGRADED_PCT,
                MEMORY_UNHEALTHY_PCT,
            ));
        }

        checks.push(match self.pool.state() {
            PoolState::Running | PoolState::Uninitialized => HealthCheckResult::healthy("worker_pool"),
            PoolState::Resizing => HealthCheckResult::degraded("worker_pool", "resize in progress"),
            PoolState::ShutDown => HealthCheckResult::unhealthy("worker_pool", "shut down"),
        });

        let loops = [
            ("monitor_loop", self.monitor.is_running()),
            ("tuner_loop", self.tuner.is_running()),
            ("precompute_loop", self.precompute.is_running()),
        ];
        for (name, running) in loops {
            checks.push(if running || !self.health.is_ready() {
                HealthCheckResult::healthy(name)
            } else {
                HealthCheckResult::degraded(name, "background loop not running")
            });
        }

        self.health.report(checks)
    }

    pub fn status(&self) -> LayerStatus {
        LayerStatus {
            cache: self.cache.stats(),
            pool: self.pool.stats(),
            tuner: self.tuner.status(),
            precompute: self.precompute.status(),
        }
    }
}

// =============================================================================
// Process-wide accessor
// =============================================================================

/// Install the process-wide layer. Fails if one is already installed.
pub fn install_global(layer: Arc<OptimizationLayer>) -> Result<()> {
    GLOBAL
        .set(layer)
        .map_err(|_| Error::Config("optimization layer already installed".to_string()))
}

/// The process-wide layer, if installed
pub fn global() -> Option<Arc<OptimizationLayer>> {
    GLOBAL.get().cloned()
}

// =============================================================================
// Tests
// =============================================================================
