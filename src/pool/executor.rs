//! Adaptive Worker Pool
//!
//! Concurrency is bounded by a semaphore inside an execution context. A
//! resize takes the context lock exclusively, drains the old context by
//! acquiring all of its permits, then swaps in a fresh context. Submitters
//! only hold the lock long enough to clone the live context, and retry on
//! the new one if the old semaphore closes under them.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, instrument, warn};

use super::config::{WorkerPoolConfig, WorkloadClass};
use super::sizing::{decide_resize, initial_worker_count, ResizeDecision, ResizeInputs};
use crate::error::{Error, Result};
use crate::monitoring::{OperationHandle, PerformanceMonitor};

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Uninitialized,
    Running,
    /// Transient: a resize is draining the old context
    Resizing,
    /// Terminal
    ShutDown,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub workload: WorkloadClass,
    /// Tasks currently executing
    pub running: usize,
    /// Tasks admitted but waiting for a worker
    pub queued: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub resize_count: u64,
}

struct ExecutionContext {
    generation: u64,
    workers: usize,
    semaphore: Arc<Semaphore>,
}

impl ExecutionContext {
    fn new(generation: u64, workers: usize) -> Self {
        Self {
            generation,
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
        }
    }
}

// =============================================================================
// Task handle
// =============================================================================

/// Future resolving to the result of a submitted task
#[must_use = "a TaskHandle does nothing unless awaited"]
pub struct TaskHandle<T> {
    inner: TaskInner<T>,
}

enum TaskInner<T> {
    Spawned(JoinHandle<Result<T>>),
    /// Refused at submission; the error is handed out once
    Rejected(Option<Error>),
}

impl<T> TaskHandle<T> {
    fn rejected(error: Error) -> Self {
        Self {
            inner: TaskInner::Rejected(Some(error)),
        }
    }

    /// Cancel the task; awaiting it then yields `Error::TaskCancelled`
    pub fn abort(&self) {
        if let TaskInner::Spawned(handle) = &self.inner {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.inner {
            TaskInner::Spawned(handle) => handle.is_finished(),
            TaskInner::Rejected(_) => true,
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            TaskInner::Spawned(handle) => match Pin::new(handle).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(join_error)) => Poll::Ready(Err(join_error.into())),
                Poll::Pending => Poll::Pending,
            },
            TaskInner::Rejected(error) => Poll::Ready(Err(error
                .take()
                .unwrap_or_else(|| Error::Internal("task handle polled after completion".to_string())))),
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Task executor whose concurrency follows monitor trends
pub struct WorkerPool {
    config: WorkerPoolConfig,
    monitor: Arc<PerformanceMonitor>,
    runtime: Option<Handle>,
    context: RwLock<Option<Arc<ExecutionContext>>>,
    state: Mutex<PoolState>,
    workers: AtomicUsize,
    resizing: AtomicBool,
    last_resize: Mutex<Option<Instant>>,
    generation: AtomicU64,

    outstanding: AtomicUsize,
    running: AtomicUsize,
    drained: Notify,
    next_task_id: AtomicU64,
    abort_handles: DashMap<u64, AbortHandle>,

    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    resize_count: AtomicU64,
}

/// Decrements the outstanding count when a task ends, however it ends
struct OutstandingGuard {
    pool: Arc<WorkerPool>,
    task_id: u64,
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.pool.abort_handles.remove(&self.task_id);
        if self.pool.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.drained.notify_waiters();
        }
    }
}

/// Clears the resize flag and leaves `Resizing`, even if the resize
/// future is dropped mid-drain
struct ResizeGuard<'a> {
    pool: &'a WorkerPool,
}

impl Drop for ResizeGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.pool.state.lock();
            if *state == PoolState::Resizing {
                *state = PoolState::Running;
            }
        }
        self.pool.resizing.store(false, Ordering::Release);
    }
}

/// Closes the monitor operation and running count, including on abort
struct RunGuard {
    pool: Arc<WorkerPool>,
    operation: Option<OperationHandle>,
    _permit: OwnedSemaphorePermit,
}

impl RunGuard {
    fn finish(mut self, error: Option<&Error>) {
        if let Some(op) = self.operation.take() {
            match error {
                Some(e) => {
                    self.pool.failed.fetch_add(1, Ordering::Relaxed);
                    self.pool.monitor.record_error(&op, e.to_string());
                }
                None => {
                    self.pool.completed.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.pool.monitor.end_operation(op, BTreeMap::new());
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.pool.running.fetch_sub(1, Ordering::AcqRel);
        if let Some(op) = self.operation.take() {
            self.pool.failed.fetch_add(1, Ordering::Relaxed);
            self.pool.monitor.record_error(&op, "cancelled");
            self.pool.monitor.end_operation(op, BTreeMap::new());
        }
    }
}

impl WorkerPool {
    /// Create an uninitialized pool; the first submission (or `start`)
    /// sizes it from the latest resource snapshot.
    ///
    /// Tasks are spawned onto the runtime current at construction when the
    /// submitter is not itself inside one.
    pub fn new(config: WorkerPoolConfig, monitor: Arc<PerformanceMonitor>) -> Arc<Self> {
        Self::with_runtime(config, monitor, Handle::try_current().ok())
    }

    /// Create an uninitialized pool bound to `runtime`
    pub fn with_runtime(
        config: WorkerPoolConfig,
        monitor: Arc<PerformanceMonitor>,
        runtime: Option<Handle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            monitor,
            runtime,
            context: RwLock::new(None),
            state: Mutex::new(PoolState::Uninitialized),
            workers: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
            last_resize: Mutex::new(None),
            generation: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            drained: Notify::new(),
            next_task_id: AtomicU64::new(0),
            abort_handles: DashMap::new(),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            resize_count: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    fn runtime(&self) -> Option<Handle> {
        Handle::try_current().ok().or_else(|| self.runtime.clone())
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Current worker count (0 before initialization)
    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::Acquire)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Size and create the execution context. Idempotent; returns the
    /// worker count.
    pub async fn start(&self) -> Result<usize> {
        let mut guard = self.context.write().await;
        if let Some(ctx) = guard.as_ref() {
            return Ok(ctx.workers);
        }
        if self.state() == PoolState::ShutDown {
            return Err(Error::PoolShutDown);
        }

        let snapshot = match self.monitor.latest_resource_snapshot() {
            Some(snapshot) => snapshot,
            None => self.monitor.capture_resource_snapshot(),
        };
        let workers = initial_worker_count(
            &self.config,
            snapshot.cpu_count,
            snapshot.available_memory_bytes,
        );
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *guard = Some(Arc::new(ExecutionContext::new(generation, workers)));
        self.workers.store(workers, Ordering::Release);
        *self.state.lock() = PoolState::Running;

        info!(
            workers,
            workload = %self.config.workload,
            cpu_count = snapshot.cpu_count,
            "Worker pool started"
        );
        Ok(workers)
    }

    /// Stop accepting work. With `drain`, wait up to `shutdown_timeout` for
    /// admitted tasks; anything still outstanding afterwards is aborted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, drain: bool) {
        {
            let mut state = self.state.lock();
            if *state == PoolState::ShutDown {
                return;
            }
            *state = PoolState::ShutDown;
        }

        if drain {
            let wait = async {
                loop {
                    let notified = self.drained.notified();
                    if self.outstanding.load(Ordering::Acquire) == 0 {
                        break;
                    }
                    notified.await;
                }
            };
            if tokio::time::timeout(self.config.shutdown_timeout, wait)
                .await
                .is_err()
            {
                warn!(
                    outstanding = self.outstanding.load(Ordering::Acquire),
                    timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                    "Worker pool drain timed out, aborting remaining tasks"
                );
            }
        }

        let aborted = self.abort_handles.len();
        for entry in self.abort_handles.iter() {
            entry.value().abort();
        }
        self.abort_handles.clear();

        if let Some(ctx) = self.context.write().await.take() {
            ctx.semaphore.close();
        }
        self.workers.store(0, Ordering::Release);
        info!(drain, aborted, "Worker pool shut down");
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Run a blocking closure on the pool
    pub fn submit<T, E, F>(self: &Arc<Self>, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.submit_named("pool_task", task)
    }

    /// Run a blocking closure, recording it under `name` in the monitor
    pub fn submit_named<T, E, F>(self: &Arc<Self>, name: &str, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.spawn_tracked(name, async move {
            match tokio::task::spawn_blocking(task).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::TaskFailed(e.to_string())),
                Err(join_error) => Err(join_error.into()),
            }
        })
    }

    /// Run a future on the pool
    pub fn submit_async<T, E, Fut>(self: &Arc<Self>, name: &str, future: Fut) -> TaskHandle<T>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.spawn_tracked(name, async move {
            match tokio::spawn(future).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::TaskFailed(e.to_string())),
                Err(join_error) => Err(join_error.into()),
            }
        })
    }

    fn spawn_tracked<T, Fut>(self: &Arc<Self>, name: &str, work: Fut) -> TaskHandle<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.state() == PoolState::ShutDown {
            return TaskHandle::rejected(Error::PoolShutDown);
        }
        let Some(runtime) = self.runtime() else {
            return TaskHandle::rejected(Error::Internal(
                "no Tokio runtime available for the worker pool".to_string(),
            ));
        };

        self.maybe_autoscale(&runtime);

        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::clone(self);
        let name = name.to_string();

        let inner = runtime.spawn(async move {
            let _outstanding = OutstandingGuard {
                pool: pool.clone(),
                task_id,
            };
            let permit = pool.acquire_permit().await?;

            pool.running.fetch_add(1, Ordering::AcqRel);
            let mut tags = BTreeMap::new();
            tags.insert("component".to_string(), "worker_pool".to_string());
            let run = RunGuard {
                pool: pool.clone(),
                operation: Some(pool.monitor.start_operation(name, tags)),
                _permit: permit,
            };

            let result = work.await;
            run.finish(result.as_ref().err());
            result
        });

        self.abort_handles.insert(task_id, inner.abort_handle());
        if inner.is_finished() {
            self.abort_handles.remove(&task_id);
        }
        TaskHandle {
            inner: TaskInner::Spawned(inner),
        }
    }

    async fn live_context(&self) -> Result<Arc<ExecutionContext>> {
        loop {
            {
                let guard = self.context.read().await;
                if let Some(ctx) = guard.as_ref() {
                    return Ok(ctx.clone());
                }
            }
            if self.state() == PoolState::ShutDown {
                return Err(Error::PoolShutDown);
            }
            self.start().await?;
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        loop {
            let ctx = self.live_context().await?;
            match ctx.semaphore.clone().acquire_owned().await {
                Ok(permit) => return Ok(permit),
                // closed by a resize (retry on the new context) or by shutdown
                Err(_) => {
                    if self.state() == PoolState::ShutDown {
                        return Err(Error::PoolShutDown);
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Apply `task` to every item in ordered batches and return the results
    /// in input order. Batch positions are tracked by index, not completion.
    ///
    /// `batch_size` defaults to spreading the items over four batches per
    /// worker. The first failing batch fails the call.
    pub async fn batch_process<I, O, E, F>(
        self: &Arc<Self>,
        task: F,
        items: Vec<I>,
        batch_size: Option<usize>,
    ) -> Result<Vec<O>>
    where
        F: Fn(I) -> std::result::Result<O, E> + Send + Sync + 'static,
        I: Send + 'static,
        O: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let total = items.len();
        let batch_size = match batch_size {
            Some(size) => size.max(1),
            None => {
                let workers = self.start().await?.max(1);
                total.div_ceil(workers * 4).max(1)
            }
        };

        let task = Arc::new(task);
        let mut handles = Vec::with_capacity(total.div_ceil(batch_size));
        let mut iter = items.into_iter().peekable();
        let mut batch_index = 0usize;
        while iter.peek().is_some() {
            let batch: Vec<I> = iter.by_ref().take(batch_size).collect();
            let task = Arc::clone(&task);
            let index = batch_index;
            let handle = self.submit_named("batch", move || {
                batch
                    .into_iter()
                    .map(|item| task(item))
                    .collect::<std::result::Result<Vec<O>, E>>()
                    .map(|outputs| (index, outputs))
            });
            handles.push(handle);
            batch_index += 1;
        }

        let mut slots: Vec<Option<Vec<O>>> = (0..batch_index).map(|_| None).collect();
        for result in join_all(handles).await {
            let (index, outputs) = result?;
            slots[index] = Some(outputs);
        }

        let mut results = Vec::with_capacity(total);
        for slot in slots {
            match slot {
                Some(outputs) => results.extend(outputs),
                None => return Err(Error::Internal("batch result missing".to_string())),
            }
        }
        debug!(items = total, batch_size, batches = batch_index, "Batch processed");
        Ok(results)
    }

    // =========================================================================
    // Resizing
    // =========================================================================

    /// Resize to `workers` (clamped to bounds), draining the current
    /// context first. Returns the worker count in effect afterwards.
    ///
    /// A resize already in progress wins; this call then returns the
    /// current count without resizing.
    #[instrument(skip(self))]
    pub async fn resize(&self, workers: usize) -> Result<usize> {
        let target = self.config.clamp(workers);
        if self.state() == PoolState::ShutDown {
            return Err(Error::PoolShutDown);
        }
        if self.resizing.swap(true, Ordering::AcqRel) {
            debug!(target, "Resize already in progress, skipping");
            return Ok(self.worker_count());
        }
        let _guard = ResizeGuard { pool: self };
        self.resize_locked(target).await
    }

    async fn resize_locked(&self, target: usize) -> Result<usize> {
        if self.context.read().await.is_none() {
            self.start().await?;
        }

        let mut guard = self.context.write().await;
        let Some(old) = guard.clone() else {
            return Err(Error::PoolShutDown);
        };
        if old.workers == target {
            return Ok(target);
        }

        {
            let mut state = self.state.lock();
            if *state == PoolState::ShutDown {
                return Err(Error::PoolShutDown);
            }
            *state = PoolState::Resizing;
        }

        let started = Instant::now();
        let drain = old.semaphore.acquire_many(old.workers as u32);
        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(Ok(permits)) => permits.forget(),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                from = old.workers,
                to = target,
                "Resize drain timed out, swapping context with tasks still running"
            ),
        }
        old.semaphore.close();

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *guard = Some(Arc::new(ExecutionContext::new(generation, target)));
        self.workers.store(target, Ordering::Release);
        *self.last_resize.lock() = Some(Instant::now());
        self.resize_count.fetch_add(1, Ordering::Relaxed);
        drop(guard);

        info!(
            from = old.workers,
            to = target,
            generation,
            previous_generation = old.generation,
            drain_ms = started.elapsed().as_millis() as u64,
            "Worker pool resized"
        );
        Ok(target)
    }

    fn resize_inputs(&self) -> Option<ResizeInputs> {
        let resource = self.monitor.get_resource_trend(self.config.trend_window);
        if resource.is_empty() {
            return None;
        }
        let performance = self.monitor.get_performance_trend(self.config.trend_window);
        Some(ResizeInputs {
            current_workers: self.worker_count(),
            cpu_percent: resource.cpu.avg,
            memory_percent: resource.memory.avg,
            latency_direction: performance.duration_ms.direction,
        })
    }

    fn in_cooldown(&self) -> bool {
        self.last_resize
            .lock()
            .map(|at| at.elapsed() < self.config.resize_cooldown)
            .unwrap_or(false)
    }

    /// Evaluate monitor trends and resize if warranted, honouring the
    /// cooldown. Returns the new worker count if a resize happened.
    pub async fn autoscale(&self) -> Result<Option<usize>> {
        if self.state() != PoolState::Running || self.in_cooldown() {
            return Ok(None);
        }
        let Some(inputs) = self.resize_inputs() else {
            return Ok(None);
        };
        match decide_resize(&self.config, &inputs) {
            ResizeDecision::Keep => Ok(None),
            ResizeDecision::Resize { target, reason } => {
                info!(from = inputs.current_workers, to = target, reason = %reason, "Autoscaling worker pool");
                let applied = self.resize(target).await?;
                Ok((applied == target).then_some(applied))
            }
        }
    }

    /// Check for a warranted resize without blocking the caller
    fn maybe_autoscale(self: &Arc<Self>, runtime: &Handle) {
        if self.state() != PoolState::Running
            || self.resizing.load(Ordering::Acquire)
            || self.in_cooldown()
        {
            return;
        }
        let Some(inputs) = self.resize_inputs() else {
            return;
        };
        if decide_resize(&self.config, &inputs) == ResizeDecision::Keep {
            return;
        }
        let pool = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(e) = pool.autoscale().await {
                debug!(error = %e, "Background autoscale skipped");
            }
        });
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn stats(&self) -> PoolStats {
        let outstanding = self.outstanding.load(Ordering::Acquire);
        let running = self.running.load(Ordering::Acquire);
        PoolStats {
            state: self.state(),
            workers: self.worker_count(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            workload: self.config.workload,
            running,
            queued: outstanding.saturating_sub(running),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            resize_count: self.resize_count.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{InMemoryMetricSink, MonitorConfig, ScriptedSampler};
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn pool_with(
        config: WorkerPoolConfig,
        readings: &[(f64, f64)],
    ) -> (Arc<WorkerPool>, Arc<PerformanceMonitor>) {
        let monitor = PerformanceMonitor::new(
            MonitorConfig::default(),
            Arc::new(ScriptedSampler::new(readings).with_host(4, 64 * 1024 * 1024 * 1024)),
            Arc::new(InMemoryMetricSink::default()),
        );
        (WorkerPool::new(config, monitor.clone()), monitor)
    }

    fn bounded(min: usize, max: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: min,
            max_workers: max,
            resize_cooldown: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(2),
            ..WorkerPoolConfig::default()
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_lazy_start_sizes_from_host() {
        let (pool, _) = pool_with(bounded(1, 32), &[(50.0, 50.0)]);
        assert_eq!(pool.state(), PoolState::Uninitialized);

        let value = pool.submit(|| Ok::<_, String>(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.state(), PoolState::Running);
        // mixed workload on 4 cores
        assert_eq!(pool.worker_count(), 8);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let (pool, _) = pool_with(bounded(1, 4), &[(50.0, 50.0)]);
        pool.start().await.unwrap();
        pool.shutdown(true).await;
        pool.shutdown(true).await;

        assert_eq!(pool.state(), PoolState::ShutDown);
        assert_matches!(pool.submit(|| Ok::<_, String>(1)).await, Err(Error::PoolShutDown));
        assert_matches!(pool.resize(2).await, Err(Error::PoolShutDown));
    }

    #[tokio::test]
    async fn test_task_errors_and_panics_are_reported() {
        let (pool, monitor) = pool_with(bounded(1, 4), &[(50.0, 50.0)]);

        let failed = pool.submit(|| Err::<u32, _>("bad input")).await;
        assert_matches!(failed, Err(Error::TaskFailed(msg)) if msg == "bad input");

        let panicked = pool.submit(|| -> std::result::Result<u32, String> { panic!("boom") }).await;
        assert_matches!(panicked, Err(Error::TaskPanicked(_)));

        let stats = pool.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.submitted, 2);
        assert_eq!(monitor.active_operations(), 0);
        assert_eq!(
            monitor
                .completed_operations()
                .iter()
                .filter(|op| !op.succeeded())
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_submit_async() {
        let (pool, _) = pool_with(bounded(1, 4), &[(50.0, 50.0)]);
        let value = pool
            .submit_async("fetch", async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, String>("done")
            })
            .await
            .unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_workers() {
        let (pool, _) = pool_with(bounded(2, 2), &[(50.0, 50.0)]);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let active = active.clone();
                let peak = peak.clone();
                pool.submit(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
            })
            .collect();
        for result in join_all(handles).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.stats().completed, 8);
    }

    // =========================================================================
    // Batch processing
    // =========================================================================

    #[tokio::test]
    async fn test_batch_process_preserves_order() {
        let (pool, _) = pool_with(bounded(1, 8), &[(50.0, 50.0)]);
        let items: Vec<u64> = (0..100).collect();

        let results = pool
            .batch_process(
                |x: u64| {
                    // later items finish first
                    std::thread::sleep(Duration::from_micros(200 * (100 - x)));
                    Ok::<_, String>(x * 2)
                },
                items,
                Some(10),
            )
            .await
            .unwrap();

        let expected: Vec<u64> = (0..100).map(|x| x * 2).collect();
        assert_eq!(results, expected);
    }

    #[tokio::test]
    async fn test_batch_process_default_size_and_errors() {
        let (pool, _) = pool_with(bounded(1, 8), &[(50.0, 50.0)]);
        let results = pool
            .batch_process(|x: i32| Ok::<_, String>(x + 1), (0..37).collect(), None)
            .await
            .unwrap();
        assert_eq!(results.len(), 37);
        assert_eq!(results[36], 37);

        let failed = pool
            .batch_process(
                |x: i32| if x == 5 { Err(format!("bad item {}", x)) } else { Ok(x) },
                (0..10).collect(),
                Some(3),
            )
            .await;
        assert_matches!(failed, Err(Error::TaskFailed(msg)) if msg.contains("bad item 5"));

        let empty: Vec<i32> = pool
            .batch_process(|x: i32| Ok::<_, String>(x), Vec::new(), None)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    // =========================================================================
    // Resizing
    // =========================================================================

    #[tokio::test]
    async fn test_resize_clamps_to_bounds() {
        let (pool, _) = pool_with(bounded(2, 6), &[(50.0, 50.0)]);
        pool.start().await.unwrap();

        // 4 cores, mixed: 8 clamped to 6
        assert_eq!(pool.worker_count(), 6);
        assert_eq!(pool.resize(0).await.unwrap(), 2);
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.resize(100).await.unwrap(), 6);
        // already at target: no resize
        assert_eq!(pool.resize(6).await.unwrap(), 6);
        assert_eq!(pool.stats().resize_count, 2);
        assert_eq!(pool.state(), PoolState::Running);
    }

    #[tokio::test]
    async fn test_resize_waits_for_in_flight_and_keeps_accepting() {
        let (pool, _) = pool_with(bounded(1, 8), &[(50.0, 50.0)]);
        pool.start().await.unwrap();

        let slow = pool.submit(|| {
            std::thread::sleep(Duration::from_millis(100));
            Ok::<_, String>("slow")
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let resizer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.resize(3).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // submitted during the drain: blocks briefly, does not fail
        let during = pool.submit(|| Ok::<_, String>("during"));

        assert_eq!(resizer.await.unwrap().unwrap(), 3);
        assert_eq!(slow.await.unwrap(), "slow");
        assert_eq!(during.await.unwrap(), "during");
    }

    #[tokio::test]
    async fn test_cancelled_resize_leaves_pool_running() {
        let (pool, _) = pool_with(bounded(1, 8), &[(50.0, 50.0)]);
        assert_eq!(pool.start().await.unwrap(), 8);

        let slow = pool.submit(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok::<_, String>(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // dropped while draining the busy worker
        let cancelled = tokio::time::timeout(Duration::from_millis(50), pool.resize(3)).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.state(), PoolState::Running);
        assert_eq!(pool.worker_count(), 8);
        assert_eq!(pool.stats().resize_count, 0);

        assert_eq!(pool.resize(2).await.unwrap(), 2);
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.state(), PoolState::Running);
        slow.await.unwrap();
        assert_eq!(pool.submit(|| Ok::<_, String>(7)).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_from_plain_thread() {
        let (pool, _) = pool_with(bounded(1, 4), &[(50.0, 50.0)]);

        let submitter = pool.clone();
        let handle = std::thread::spawn(move || submitter.submit(|| Ok::<_, String>(21 * 2)))
            .join()
            .unwrap();
        assert_eq!(handle.await.unwrap(), 42);
        assert_eq!(pool.state(), PoolState::Running);
    }

    #[test]
    fn test_submit_without_runtime_is_rejected() {
        let (pool, _) = pool_with(bounded(1, 4), &[(50.0, 50.0)]);
        let handle = pool.submit(|| Ok::<_, String>(()));
        assert!(handle.is_finished());
        assert_matches!(futures::executor::block_on(handle), Err(Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_autoscale_shrinks_under_memory_pressure() {
        let (pool, monitor) = pool_with(bounded(1, 32), &[(50.0, 97.0)]);
        pool.start().await.unwrap();
        for _ in 0..3 {
            monitor.capture_resource_snapshot();
        }

        let before = pool.worker_count();
        let after = pool.autoscale().await.unwrap().unwrap();
        assert!(after < before);
        assert!(after >= 1);
    }

    #[tokio::test]
    async fn test_autoscale_respects_cooldown() {
        let mut config = bounded(1, 32);
        config.resize_cooldown = Duration::from_secs(3600);
        let (pool, monitor) = pool_with(config, &[(5.0, 40.0)]);
        pool.start().await.unwrap();
        monitor.capture_resource_snapshot();

        assert!(pool.autoscale().await.unwrap().is_some());
        assert!(pool.autoscale().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_without_drain_aborts() {
        let (pool, _) = pool_with(bounded(1, 1), &[(50.0, 50.0)]);
        pool.start().await.unwrap();
        let _busy = pool.submit(|| {
            std::thread::sleep(Duration::from_millis(50));
            Ok::<_, String>(())
        });
        let queued = pool.submit(|| Ok::<_, String>(()));
        tokio::time::sleep(Duration::from_millis(5)).await;

        pool.shutdown(false).await;
        assert_matches!(queued.await, Err(Error::TaskCancelled) | Err(Error::PoolShutDown));
    }
}
