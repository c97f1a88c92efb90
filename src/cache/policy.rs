//! Cache Eviction Policy
//!
//! LRU with a hysteresis band: eviction starts once usage crosses the high
//! watermark and drains oldest-accessed entries until usage is at or below
//! the low watermark.

use super::entry::CacheEntry;

/// Eviction policy configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    /// High watermark (trigger eviction), fraction of max bytes
    pub high_watermark: f64,
    /// Low watermark (stop eviction), fraction of max bytes
    pub low_watermark: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            high_watermark: 0.90,
            low_watermark: 0.70,
        }
    }
}

impl EvictionPolicy {
    /// Create a policy from explicit watermarks
    pub fn new(high_watermark: f64, low_watermark: f64) -> Self {
        Self {
            high_watermark,
            low_watermark,
        }
    }

    /// Bytes above which eviction starts
    pub fn trigger_bytes(&self, max_bytes: u64) -> u64 {
        (max_bytes as f64 * self.high_watermark) as u64
    }

    /// Bytes eviction drains down to
    pub fn target_bytes(&self, max_bytes: u64) -> u64 {
        (max_bytes as f64 * self.low_watermark) as u64
    }

    /// Check if usage has crossed the high watermark
    pub fn needs_eviction(&self, total_bytes: u64, max_bytes: u64) -> bool {
        total_bytes > self.trigger_bytes(max_bytes)
    }

    /// Pick the keys to evict, least recently accessed first.
    ///
    /// `protect` names an entry that must survive this pass (the entry that
    /// was just written).
    pub fn select_victims<'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry>,
        total_bytes: u64,
        max_bytes: u64,
        protect: Option<&str>,
    ) -> Vec<String> {
        if !self.needs_eviction(total_bytes, max_bytes) {
            return Vec::new();
        }

        let target = self.target_bytes(max_bytes);
        let mut candidates: Vec<&CacheEntry> = entries
            .filter(|e| protect != Some(e.key.as_str()))
            .collect();
        candidates.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut remaining = total_bytes;
        let mut victims = Vec::new();
        for entry in candidates {
            if remaining <= target {
                break;
            }
            remaining = remaining.saturating_sub(entry.size_bytes);
            victims.push(entry.key.clone());
        }
        victims
    }
}

// =============================================================================
// Tests
// =============================================================================
