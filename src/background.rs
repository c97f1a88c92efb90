//! Background Loops
//!
//! Periodic control loops (monitor sampling, auto-tuning, precompute) share
//! one start/stop discipline:
//!
//! - `start` while running is a no-op with a warning
//! - `stop` while stopped is a no-op
//! - `stop` cancels the loop immediately (not at the next tick) and joins it
//!   with a timeout, aborting the task if it does not exit in time
//!
//! The runtime handle is captured at construction, so `start` and `stop`
//! work from threads outside the runtime as well.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle to a running loop
struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// A named, restartable periodic background loop
pub struct BackgroundLoop {
    name: &'static str,
    runtime: Option<Handle>,
    running: Mutex<Option<Running>>,
}

impl BackgroundLoop {
    /// Create an idle loop bound to the current runtime, if any
    pub fn new(name: &'static str) -> Self {
        Self::with_runtime(name, Handle::try_current().ok())
    }

    /// Create an idle loop that spawns onto `runtime`
    pub fn with_runtime(name: &'static str, runtime: Option<Handle>) -> Self {
        Self {
            name,
            runtime,
            running: Mutex::new(None),
        }
    }

    /// The caller's runtime, else the one captured at construction
    fn runtime(&self) -> Option<Handle> {
        Handle::try_current().ok().or_else(|| self.runtime.clone())
    }

    /// Start the loop, calling `tick` once per `period`.
    ///
    /// The first tick fires after one full period. Returns `false` if the
    /// loop was already running or no runtime is available.
    pub fn start<F, Fut>(&self, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if let Some(existing) = running.as_ref() {
            if !existing.handle.is_finished() {
                warn!(loop_name = self.name, "Background loop already running");
                return false;
            }
        }

        let Some(runtime) = self.runtime() else {
            error!(loop_name = self.name, "No Tokio runtime available, background loop not started");
            return false;
        };

        let token = CancellationToken::new();
        let child = token.clone();
        let name = self.name;

        let handle = runtime.spawn(async move {
            info!(loop_name = name, period_ms = period.as_millis() as u64, "Background loop started");
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately on the first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = child.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
            info!(loop_name = name, "Background loop stopped");
        });

        *running = Some(Running { token, handle });
        true
    }

    /// Stop the loop and wait up to `timeout` for it to exit.
    ///
    /// Returns `false` if the loop was not running.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let running = self.running.lock().take();
        let Some(running) = running else {
            debug!(loop_name = self.name, "Stop requested but loop is not running");
            return false;
        };

        running.token.cancel();
        let abort = running.handle.abort_handle();
        let name = self.name;
        let join = async move {
            if tokio::time::timeout(timeout, running.handle).await.is_err() {
                warn!(loop_name = name, "Background loop did not exit in time, aborting");
                abort.abort();
            }
        };
        // the timer needs a runtime; callers outside one join through a task
        match self.runtime() {
            Some(runtime) if Handle::try_current().is_err() => {
                if runtime.spawn(join).await.is_err() {
                    warn!(loop_name = name, "Background loop join task failed");
                }
            }
            _ => join.await,
        }
        true
    }

    /// Whether the loop is currently running
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Loop name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
