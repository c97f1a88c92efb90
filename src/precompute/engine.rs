//! Precompute Engine
//!
//! Tracks which strategy combinations are requested most, and in the
//! background computes those results ahead of demand so the next request is
//! a cache hit.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::job::{JobStatus, PrecomputeJob};
use super::usage::{combination_signature, ParameterCombination, RequestRecord, UsageTracker};
use crate::background::BackgroundLoop;
use crate::cache::{write_atomic, CacheCategory, CacheStore};
use crate::config::ensure;
use crate::error::{Error, Result};
use crate::monitoring::{MetricCategory, MetricRecord, PerformanceMonitor};
use crate::pool::WorkerPool;

/// Default usage state file name inside the cache directory
pub const USAGE_STATE_FILE: &str = "precompute_usage.json";

/// Params under which precomputed results are stored; the signature
/// already covers the request parameters.
const STORED_PARAMS: &BTreeMap<String, String> = &BTreeMap::new();

// =============================================================================
// Configuration
// =============================================================================

/// Precompute engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrecomputeConfig {
    /// Background cycle period
    #[serde(with = "crate::config::duration_serde")]
    pub interval: Duration,
    /// No new jobs are admitted once a cycle has run this long
    #[serde(with = "crate::config::duration_serde")]
    pub cycle_budget: Duration,
    /// Combinations considered per cycle
    pub top_n: usize,
    /// Minimum occurrences before a combination is precomputed
    pub min_requests: u64,
    /// TTL of stored results
    #[serde(with = "crate::config::duration_serde")]
    pub result_ttl: Duration,
    pub request_log_capacity: usize,
    /// How long finished job outcomes stay visible
    #[serde(with = "crate::config::duration_serde")]
    pub job_retention: Duration,
    /// Usage log location; defaults to the cache directory
    pub state_file: Option<PathBuf>,
}

impl Default for PrecomputeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            cycle_budget: Duration::from_secs(120),
            top_n: 20,
            min_requests: 3,
            result_ttl: Duration::from_secs(3600),
            request_log_capacity: 10_000,
            job_retention: Duration::from_secs(3600),
            state_file: None,
        }
    }
}

impl PrecomputeConfig {
    pub fn validate(&self) -> Result<()> {
        ensure(!self.interval.is_zero(), || {
            "precompute.interval must be > 0".to_string()
        })?;
        ensure(!self.cycle_budget.is_zero(), || {
            "precompute.cycle_budget must be > 0".to_string()
        })?;
        ensure(self.min_requests >= 1, || {
            "precompute.min_requests must be >= 1".to_string()
        })?;
        ensure(self.request_log_capacity > 0, || {
            "precompute.request_log_capacity must be > 0".to_string()
        })?;
        Ok(())
    }
}

// =============================================================================
// Executors
// =============================================================================

/// Error type returned by strategy executors
pub type ExecutorError = Box<dyn std::error::Error + Send + Sync>;

/// Produces the result of one strategy combination.
///
/// Executors run on the worker pool's blocking threads.
pub trait StrategyExecutor: Send + Sync {
    fn execute(
        &self,
        identity: &str,
        timeframe: &str,
        params: &Value,
    ) -> std::result::Result<Value, ExecutorError>;
}

impl<F> StrategyExecutor for F
where
    F: Fn(&str, &str, &Value) -> std::result::Result<Value, ExecutorError> + Send + Sync,
{
    fn execute(
        &self,
        identity: &str,
        timeframe: &str,
        params: &Value,
    ) -> std::result::Result<Value, ExecutorError> {
        self(identity, timeframe, params)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Outcome of one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    /// Combinations returned by the top-N query
    pub considered: usize,
    pub skipped_fresh: usize,
    pub skipped_unregistered: usize,
    /// Jobs not admitted because the budget ran out
    pub deferred: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

/// Engine status for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecomputeStatus {
    pub active: bool,
    pub tracked_requests: usize,
    pub distinct_combinations: usize,
    pub registered_executors: Vec<String>,
    pub retained_jobs: usize,
    pub cycles: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub skipped_fresh: u64,
}

// =============================================================================
// Engine
// =============================================================================

/// Usage-driven precomputation of strategy results
pub struct PrecomputeEngine {
    config: PrecomputeConfig,
    state_file: PathBuf,
    cache: Arc<CacheStore>,
    pool: Arc<WorkerPool>,
    monitor: Arc<PerformanceMonitor>,
    usage: Mutex<UsageTracker>,
    executors: DashMap<String, Arc<dyn StrategyExecutor>>,
    jobs: Mutex<VecDeque<PrecomputeJob>>,
    /// One cycle at a time, scheduled or immediate
    cycle_lock: tokio::sync::Mutex<()>,
    cycles: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    skipped_fresh: AtomicU64,
    background: BackgroundLoop,
}

impl PrecomputeEngine {
    /// Create the engine, loading any persisted usage state
    pub async fn open(
        config: PrecomputeConfig,
        cache: Arc<CacheStore>,
        pool: Arc<WorkerPool>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Arc<Self> {
        let state_file = config
            .state_file
            .clone()
            .unwrap_or_else(|| cache.cache_dir().join(USAGE_STATE_FILE));
        let usage = UsageTracker::load(&state_file, config.request_log_capacity).await;

        Arc::new(Self {
            usage: Mutex::new(usage),
            executors: DashMap::new(),
            jobs: Mutex::new(VecDeque::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
            cycles: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            skipped_fresh: AtomicU64::new(0),
            background: BackgroundLoop::new("precompute-engine"),
            state_file,
            config,
            cache,
            pool,
            monitor,
        })
    }

    pub fn config(&self) -> &PrecomputeConfig {
        &self.config
    }

    pub fn state_file(&self) -> &std::path::Path {
        &self.state_file
    }

    // =========================================================================
    // Usage tracking
    // =========================================================================

    /// Record a served request. Returns the combination signature.
    pub fn track_request<P: Serialize + ?Sized>(
        &self,
        strategy_type: &str,
        identity: &str,
        timeframe: &str,
        params: &P,
        duration_ms: f64,
        result_size_mb: f64,
    ) -> Result<String> {
        let params = serde_json::to_value(params)?;
        let signature = combination_signature(strategy_type, identity, timeframe, &params)?;
        self.usage.lock().track(RequestRecord {
            signature: signature.clone(),
            strategy_type: strategy_type.to_string(),
            identity: identity.to_string(),
            timeframe: timeframe.to_string(),
            params,
            duration_ms,
            result_size_mb,
            timestamp: Utc::now(),
        });
        Ok(signature)
    }

    /// Most requested combinations with at least `min_requests` occurrences
    pub fn get_top_combinations(&self, limit: usize, min_requests: u64) -> Vec<ParameterCombination> {
        self.usage.lock().top(limit, min_requests)
    }

    /// Register the executor for a strategy type, replacing any previous one
    pub fn register_executor(
        &self,
        strategy_type: impl Into<String>,
        executor: impl StrategyExecutor + 'static,
    ) {
        let strategy_type = strategy_type.into();
        info!(strategy_type = %strategy_type, "Registered precompute executor");
        self.executors.insert(strategy_type, Arc::new(executor));
    }

    pub fn registered_executors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // =========================================================================
    // Results
    // =========================================================================

    /// Look up a stored result for the exact combination, whether it was
    /// precomputed or deposited by the request path.
    pub async fn check_precomputed_result<T, P>(
        &self,
        strategy_type: &str,
        identity: &str,
        timeframe: &str,
        params: &P,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let params = serde_json::to_value(params)?;
        let signature = combination_signature(strategy_type, identity, timeframe, &params)?;
        self.cache
            .get(CacheCategory::Precomputed, &signature, STORED_PARAMS)
            .await
    }

    /// Store a result computed by the request path under the combination's
    /// signature. Returns the cache key.
    pub async fn store_result<T, P>(
        &self,
        strategy_type: &str,
        identity: &str,
        timeframe: &str,
        params: &P,
        result: &T,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        P: Serialize + ?Sized,
    {
        let params = serde_json::to_value(params)?;
        let signature = combination_signature(strategy_type, identity, timeframe, &params)?;
        self.store_signature(&signature, strategy_type, result).await
    }

    async fn store_signature<T: Serialize + ?Sized>(
        &self,
        signature: &str,
        strategy_type: &str,
        result: &T,
    ) -> Result<String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("strategy_type".to_string(), strategy_type.to_string());
        self.cache
            .put_with_metadata(
                CacheCategory::Precomputed,
                signature,
                result,
                STORED_PARAMS,
                self.config.result_ttl,
                metadata,
            )
            .await
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    /// Run one scheduled cycle over the configured top N
    pub async fn run_cycle(&self) -> CycleSummary {
        let (summary, _) = self.execute(self.config.top_n).await;
        summary
    }

    /// Precompute the top `limit` combinations now, outside the schedule.
    /// Returns the status of every job created, including jobs left
    /// `Deferred` when the cycle budget ran out.
    pub async fn trigger_immediate_precompute(&self, limit: usize) -> BTreeMap<Uuid, JobStatus> {
        let (_, jobs) = self.execute(limit).await;
        jobs.into_iter().map(|job| (job.id, job.status)).collect()
    }

    #[instrument(skip(self))]
    async fn execute(&self, limit: usize) -> (CycleSummary, Vec<PrecomputeJob>) {
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();
        let deadline = started + self.config.cycle_budget;

        let candidates = self.get_top_combinations(limit, self.config.min_requests);
        let mut summary = CycleSummary {
            considered: candidates.len(),
            ..CycleSummary::default()
        };

        let mut pending: Vec<(PrecomputeJob, Arc<dyn StrategyExecutor>)> = Vec::new();
        for combination in candidates {
            let Some(executor) = self
                .executors
                .get(&combination.strategy_type)
                .map(|e| Arc::clone(e.value()))
            else {
                summary.skipped_unregistered += 1;
                continue;
            };
            match self
                .cache
                .is_fresh(CacheCategory::Precomputed, &combination.signature, STORED_PARAMS, &[])
                .await
            {
                Ok(true) => {
                    summary.skipped_fresh += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(signature = %combination.signature, error = %e, "Freshness check failed, scheduling anyway");
                }
            }
            pending.push((PrecomputeJob::new(combination), executor));
        }
        // stable: equal priorities keep top-N order
        pending.sort_by(|a, b| b.0.priority.cmp(&a.0.priority));

        let concurrency = self.pool.worker_count().max(1);
        let mut queue = pending.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut finished = Vec::new();

        loop {
            while in_flight.len() < concurrency && Instant::now() < deadline {
                let Some((mut job, executor)) = queue.next() else {
                    break;
                };
                job.mark_running();
                let combination = job.combination.clone();
                let handle = self.pool.submit_named("precompute", move || {
                    executor
                        .execute(&combination.identity, &combination.timeframe, &combination.params)
                        .map_err(|e| e.to_string())
                });
                in_flight.push(async move { (job, handle.await) });
            }

            let Some((mut job, outcome)) = in_flight.next().await else {
                break;
            };
            match outcome {
                Ok(value) => {
                    match self
                        .store_signature(&job.combination.signature, &job.combination.strategy_type, &value)
                        .await
                    {
                        Ok(key) => job.mark_completed(key),
                        Err(e) => job.mark_failed(format!("store failed: {}", e)),
                    }
                }
                Err(e) => job.mark_failed(e.to_string()),
            }
            self.record_job(&job, &mut summary);
            finished.push(job);
        }

        let deferred: Vec<PrecomputeJob> = queue
            .map(|(mut job, _)| {
                job.mark_deferred();
                job
            })
            .collect();
        summary.deferred = deferred.len();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        if summary.deferred > 0 {
            warn!(
                deferred = summary.deferred,
                budget_ms = self.config.cycle_budget.as_millis() as u64,
                "Precompute budget exhausted, remaining jobs deferred"
            );
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.skipped_fresh
            .fetch_add(summary.skipped_fresh as u64, Ordering::Relaxed);
        self.retain_jobs(&finished);
        if let Err(e) = self.save_usage().await {
            warn!(path = %self.state_file.display(), error = %e, "Failed to persist usage state");
        }

        info!(
            considered = summary.considered,
            completed = summary.completed,
            failed = summary.failed,
            skipped_fresh = summary.skipped_fresh,
            skipped_unregistered = summary.skipped_unregistered,
            deferred = summary.deferred,
            elapsed_ms = summary.elapsed_ms,
            "Precompute cycle complete"
        );
        finished.extend(deferred);
        (summary, finished)
    }

    fn record_job(&self, job: &PrecomputeJob, summary: &mut CycleSummary) {
        let value = job.duration_ms().unwrap_or(0) as f64;
        let record = MetricRecord::new("precompute_job_ms", value, "ms", MetricCategory::Precompute)
            .with_tag("strategy_type", job.combination.strategy_type.clone());
        match job.status {
            JobStatus::Completed => {
                summary.completed += 1;
                self.jobs_completed.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job.id, priority = job.priority, "Precompute job completed");
                self.monitor.emit_metric(record.with_tag("status", "completed"));
            }
            _ => {
                summary.failed += 1;
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id = %job.id,
                    strategy_type = %job.combination.strategy_type,
                    error = job.error.as_deref().unwrap_or(""),
                    "Precompute job failed"
                );
                self.monitor.emit_metric(record.with_tag("status", "failed"));
            }
        }
    }

    fn retain_jobs(&self, finished: &[PrecomputeJob]) {
        let retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - retention;
        let mut jobs = self.jobs.lock();
        jobs.extend(finished.iter().cloned());
        jobs.retain(|job| job.completed_at.map(|at| at >= cutoff).unwrap_or(true));
    }

    /// Persist the usage log
    pub async fn save_usage(&self) -> Result<()> {
        let doc = self.usage.lock().to_json()?;
        write_atomic(&self.state_file, &doc).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the background cycle. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        let started = self.background.start(self.config.interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(engine) = weak.upgrade() {
                    engine.run_cycle().await;
                }
            }
        });
        if started {
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                top_n = self.config.top_n,
                "Precompute engine started"
            );
        }
        started
    }

    /// Stop the background cycle and persist usage. Returns `false` if not
    /// running.
    pub async fn stop(&self) -> bool {
        let stopped = self.background.stop(self.config.interval).await;
        if stopped {
            if let Err(e) = self.save_usage().await {
                warn!(error = %e, "Failed to persist usage state on stop");
            }
            info!("Precompute engine stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.background.is_running()
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Retained job outcomes, oldest first
    pub fn jobs(&self) -> Vec<PrecomputeJob> {
        self.jobs.lock().iter().cloned().collect()
    }

    pub fn status(&self) -> PrecomputeStatus {
        let (tracked_requests, distinct_combinations) = {
            let usage = self.usage.lock();
            (usage.request_count(), usage.distinct_combinations())
        };
        PrecomputeStatus {
            active: self.is_running(),
            tracked_requests,
            distinct_combinations,
            registered_executors: self.registered_executors(),
            retained_jobs: self.jobs.lock().len(),
            cycles: self.cycles.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            skipped_fresh: self.skipped_fresh.load(Ordering::Relaxed),
        }
    }

    /// Fail fast if no executor is registered for `strategy_type`
    pub fn require_executor(&self, strategy_type: &str) -> Result<()> {
        if self.executors.contains_key(strategy_type) {
            Ok(())
        } else {
            Err(Error::ExecutorNotRegistered(strategy_type.to_string()))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
