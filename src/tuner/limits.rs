//! Processing limits shared between the tuner and processing code

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Memory and streaming limits read by data-processing code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingLimits {
    /// Working memory budget
    pub memory_pool_mb: u64,
    /// Inputs larger than this are processed in chunks
    pub streaming_threshold_mb: u64,
}

/// Cloneable handle; readers always see a whole `ProcessingLimits`
#[derive(Debug, Clone)]
pub struct SharedLimits {
    inner: Arc<RwLock<ProcessingLimits>>,
}

impl SharedLimits {
    pub fn new(limits: ProcessingLimits) -> Self {
        Self {
            inner: Arc::new(RwLock::new(limits)),
        }
    }

    pub fn get(&self) -> ProcessingLimits {
        *self.inner.read()
    }

    /// Apply `f` under the write lock and return the updated limits
    pub fn update(&self, f: impl FnOnce(&mut ProcessingLimits)) -> ProcessingLimits {
        let mut limits = self.inner.write();
        f(&mut limits);
        // never tune a limit down to nothing
        limits.memory_pool_mb = limits.memory_pool_mb.max(1);
        limits.streaming_threshold_mb = limits.streaming_threshold_mb.max(1);
        *limits
    }
}
