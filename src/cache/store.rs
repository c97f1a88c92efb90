//! File-Backed Cache Store
//!
//! Payloads are JSON files under `<cache_dir>/<category>/<key>.json`; the
//! metadata index lives in memory behind one lock and is flushed to
//! `<cache_dir>/cache_index.json` after every mutation. File I/O happens
//! outside the index lock, so operations on different keys do not contend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::entry::{CacheCategory, CacheEntry};
use super::index::{CacheIndex, INDEX_FILE};
use super::key::derive_key;
use super::policy::EvictionPolicy;
use crate::config::ensure;
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Cache store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Root directory of the store
    pub cache_dir: PathBuf,
    /// Eviction ceiling in bytes
    pub max_bytes: u64,
    /// TTL used by `put_default`
    #[serde(with = "crate::config::duration_serde")]
    pub default_ttl: Duration,
    /// Fraction of `max_bytes` that triggers eviction
    pub cleanup_threshold: f64,
    /// Fraction of `max_bytes` eviction drains down to
    pub target_fraction: f64,
    /// Lower bound for runtime resizing of `max_bytes`
    pub min_bytes: u64,
    /// Upper bound for runtime resizing of `max_bytes`
    pub max_bytes_ceiling: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./.quantcache"),
            max_bytes: 1024 * 1024 * 1024,
            default_ttl: Duration::from_secs(3600),
            cleanup_threshold: 0.9,
            target_fraction: 0.7,
            min_bytes: 16 * 1024 * 1024,
            max_bytes_ceiling: 16 * 1024 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Config rooted at `cache_dir` with default limits
    pub fn with_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Validate limits and watermarks
    pub fn validate(&self) -> Result<()> {
        ensure(!self.cache_dir.as_os_str().is_empty(), || {
            "cache.cache_dir must not be empty".to_string()
        })?;
        ensure(self.max_bytes > 0, || "cache.max_bytes must be > 0".to_string())?;
        ensure(
            self.target_fraction > 0.0
                && self.target_fraction < self.cleanup_threshold
                && self.cleanup_threshold <= 1.0,
            || {
                format!(
                    "cache watermarks must satisfy 0 < target_fraction ({}) < cleanup_threshold ({}) <= 1",
                    self.target_fraction, self.cleanup_threshold
                )
            },
        )?;
        ensure(self.min_bytes <= self.max_bytes_ceiling, || {
            format!(
                "cache.min_bytes ({}) must not exceed cache.max_bytes_ceiling ({})",
                self.min_bytes, self.max_bytes_ceiling
            )
        })?;
        Ok(())
    }

    /// Eviction policy described by this config
    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy::new(self.cleanup_threshold, self.target_fraction)
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-category usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Cache store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    /// `total_bytes / max_bytes * 100`
    pub utilization_pct: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// `hits / (hits + misses)`, 0 when nothing was read
    pub hit_rate: f64,
    pub per_category: BTreeMap<CacheCategory, CategoryStats>,
}

// =============================================================================
// Store
// =============================================================================

/// Content-addressed, file-backed key/value store with TTL and LRU eviction
pub struct CacheStore {
    config: CacheConfig,
    policy: EvictionPolicy,
    max_bytes: AtomicU64,
    index: Mutex<CacheIndex>,
    flush_lock: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStore {
    /// Open (or create) a store rooted at `config.cache_dir`
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        for category in CacheCategory::ALL {
            tokio::fs::create_dir_all(config.cache_dir.join(category.as_str())).await?;
        }

        let index = CacheIndex::load(&config.cache_dir.join(INDEX_FILE)).await;
        info!(
            cache_dir = %config.cache_dir.display(),
            entries = index.len(),
            total_bytes = index.total_bytes(),
            max_bytes = config.max_bytes,
            "Cache store opened"
        );

        let store = Self {
            policy: config.eviction_policy(),
            max_bytes: AtomicU64::new(config.max_bytes),
            index: Mutex::new(index),
            flush_lock: tokio::sync::Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            config,
        };

        // a smaller max_bytes than last run may leave the store over budget
        store.evict_if_needed(None).await;
        Ok(store)
    }

    /// Store configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Root directory
    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    /// Current eviction ceiling
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    /// Derive the key for a request
    pub fn key_for<P: Serialize + ?Sized>(
        &self,
        category: CacheCategory,
        identifier: &str,
        params: &P,
    ) -> Result<String> {
        derive_key(category.as_str(), identifier, params)
    }

    /// Every write gets its own file, so removing a superseded payload can
    /// never delete the file of a newer write under the same key
    fn payload_path(&self, category: CacheCategory, key: &str, write_id: Uuid) -> PathBuf {
        self.config
            .cache_dir
            .join(category.as_str())
            .join(format!("{}-{}.json", key, write_id.simple()))
    }

    /// Payload file currently backing `key`
    pub fn stored_path(&self, key: &str) -> Option<PathBuf> {
        self.index.lock().get(key).map(|e| e.storage_path.clone())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `data` under `(category, identifier, params)` with `ttl`.
    ///
    /// A zero `ttl` never expires. Overwrites any existing entry for the
    /// same key and returns the key.
    pub async fn put<T, P>(
        &self,
        category: CacheCategory,
        identifier: &str,
        data: &T,
        params: &P,
        ttl: Duration,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        P: Serialize + ?Sized,
    {
        self.put_with_metadata(category, identifier, data, params, ttl, BTreeMap::new())
            .await
    }

    /// Store `data` with the configured default TTL
    pub async fn put_default<T, P>(
        &self,
        category: CacheCategory,
        identifier: &str,
        data: &T,
        params: &P,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        P: Serialize + ?Sized,
    {
        self.put(category, identifier, data, params, self.config.default_ttl)
            .await
    }

    /// Store `data` and attach free-form `metadata` tags to the entry
    #[instrument(skip(self, data, params, metadata))]
    pub async fn put_with_metadata<T, P>(
        &self,
        category: CacheCategory,
        identifier: &str,
        data: &T,
        params: &P,
        ttl: Duration,
        metadata: BTreeMap<String, String>,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        P: Serialize + ?Sized,
    {
        if identifier.trim().is_empty() {
            return Err(Error::validation("identifier", "must not be empty"));
        }

        let key = self.key_for(category, identifier, params)?;
        let payload = serde_json::to_vec(data)?;
        let path = self.payload_path(category, &key, Uuid::new_v4());

        write_atomic(&path, &payload).await?;

        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            category,
            identifier: identifier.to_string(),
            storage_path: path,
            created_at: now,
            last_accessed_at: now,
            size_bytes: payload.len() as u64,
            ttl,
            metadata,
        };
        let previous = self.index.lock().insert(entry);
        if let Some(previous) = previous {
            remove_payload(&previous.storage_path).await;
        }
        debug!(key = %key, size_bytes = payload.len(), "Cached value");

        self.evict_if_needed(Some(&key)).await;
        self.flush().await?;
        Ok(key)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetch the value stored under `(category, identifier, params)`
    pub async fn get<T, P>(
        &self,
        category: CacheCategory,
        identifier: &str,
        params: &P,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        self.get_fresh(category, identifier, params, &[]).await
    }

    /// Fetch a value, treating it as a miss if any of `source_files` was
    /// modified after the entry was written.
    ///
    /// Expired entries, entries whose payload is gone and entries whose
    /// payload no longer decodes are dropped as a side effect.
    pub async fn get_fresh<T, P>(
        &self,
        category: CacheCategory,
        identifier: &str,
        params: &P,
        source_files: &[PathBuf],
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let key = self.key_for(category, identifier, params)?;

        let entry = self.index.lock().get(&key).cloned();
        let Some(entry) = entry else {
            return Ok(self.miss());
        };

        if entry.is_expired() {
            debug!(key = %key, "Cache entry expired");
            self.drop_entry(&entry).await?;
            return Ok(self.miss());
        }

        if sources_newer_than(source_files, entry.created_at).await {
            debug!(key = %key, "Cache entry stale against source files");
            self.drop_entry(&entry).await?;
            return Ok(self.miss());
        }

        let raw = match tokio::fs::read(&entry.storage_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key = %key, path = %entry.storage_path.display(), "Cache payload missing, dropping entry");
                self.drop_entry(&entry).await?;
                return Ok(self.miss());
            }
            Err(e) => return Err(e.into()),
        };

        let value: T = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache payload does not decode, dropping entry");
                self.drop_entry(&entry).await?;
                return Ok(self.miss());
            }
        };

        if let Some(live) = self.index.lock().get_mut(&key) {
            live.touch();
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(value))
    }

    /// Whether a live, fresh entry exists, without reading its payload
    pub async fn is_fresh<P: Serialize + ?Sized>(
        &self,
        category: CacheCategory,
        identifier: &str,
        params: &P,
        source_files: &[PathBuf],
    ) -> Result<bool> {
        let key = self.key_for(category, identifier, params)?;
        let entry = self.index.lock().get(&key).cloned();
        let Some(entry) = entry else {
            return Ok(false);
        };
        if entry.is_expired() || sources_newer_than(source_files, entry.created_at).await {
            return Ok(false);
        }
        Ok(tokio::fs::try_exists(&entry.storage_path).await.unwrap_or(false))
    }

    fn miss<T>(&self) -> Option<T> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove an entry and its payload. Returns whether it existed.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let removed = self.index.lock().remove(key);
        match removed {
            Some(entry) => {
                remove_payload(&entry.storage_path).await;
                self.flush().await?;
                debug!(key = %key, "Invalidated cache entry");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every entry in `category`. Returns the number removed.
    pub async fn invalidate_category(&self, category: CacheCategory) -> Result<usize> {
        let removed: Vec<CacheEntry> = {
            let mut index = self.index.lock();
            index
                .keys_in(category)
                .into_iter()
                .filter_map(|k| index.remove(&k))
                .collect()
        };
        self.remove_all(removed, "Invalidated cache category", Some(category))
            .await
    }

    /// Remove every expired entry. Returns the number removed.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let removed: Vec<CacheEntry> = {
            let mut index = self.index.lock();
            let expired: Vec<String> = index
                .entries()
                .filter(|e| e.is_expired_at(now))
                .map(|e| e.key.clone())
                .collect();
            expired.into_iter().filter_map(|k| index.remove(&k)).collect()
        };
        self.remove_all(removed, "Removed expired cache entries", None)
            .await
    }

    /// Remove everything. Returns the number of entries removed.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self.index.lock().drain();
        self.remove_all(removed, "Cleared cache", None).await
    }

    async fn remove_all(
        &self,
        removed: Vec<CacheEntry>,
        message: &str,
        category: Option<CacheCategory>,
    ) -> Result<usize> {
        let count = removed.len();
        for entry in &removed {
            remove_payload(&entry.storage_path).await;
        }
        if count > 0 {
            self.flush().await?;
            info!(count, category = ?category, "{}", message);
        }
        Ok(count)
    }

    async fn drop_entry(&self, entry: &CacheEntry) -> Result<()> {
        let removed = {
            let mut index = self.index.lock();
            // only drop the exact entry we inspected, not a concurrent rewrite
            match index.get(&entry.key) {
                Some(live) if live.created_at == entry.created_at => index.remove(&entry.key),
                _ => None,
            }
        };
        if removed.is_some() {
            remove_payload(&entry.storage_path).await;
            self.flush().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Change the eviction ceiling (clamped to the configured bounds) and
    /// evict if the store is now over its threshold. Returns the new ceiling.
    pub async fn set_max_bytes(&self, max_bytes: u64) -> Result<u64> {
        let clamped = max_bytes.clamp(self.config.min_bytes, self.config.max_bytes_ceiling);
        let previous = self.max_bytes.swap(clamped, Ordering::Relaxed);
        if previous != clamped {
            info!(previous, current = clamped, "Cache max_bytes updated");
        }
        if self.evict_if_needed(None).await > 0 {
            self.flush().await?;
        }
        Ok(clamped)
    }

    async fn evict_if_needed(&self, protect: Option<&str>) -> usize {
        let max_bytes = self.max_bytes();
        let victims: Vec<CacheEntry> = {
            let mut index = self.index.lock();
            let keys = self.policy.select_victims(
                index.entries(),
                index.total_bytes(),
                max_bytes,
                protect,
            );
            keys.into_iter().filter_map(|k| index.remove(&k)).collect()
        };

        if victims.is_empty() {
            return 0;
        }

        let freed: u64 = victims.iter().map(|e| e.size_bytes).sum();
        for entry in &victims {
            remove_payload(&entry.storage_path).await;
        }
        self.evictions
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        info!(
            evicted = victims.len(),
            freed_bytes = freed,
            max_bytes,
            "Evicted least recently used cache entries"
        );
        victims.len()
    }

    // =========================================================================
    // Persistence & stats
    // =========================================================================

    /// Persist the metadata index. Flushes are serialized.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let doc = self.index.lock().to_json()?;
        write_atomic(&self.config.cache_dir.join(INDEX_FILE), &doc).await
    }

    /// Snapshot of store usage
    pub fn stats(&self) -> CacheStats {
        let max_bytes = self.max_bytes();
        let index = self.index.lock();

        let mut per_category: BTreeMap<CacheCategory, CategoryStats> = BTreeMap::new();
        for entry in index.entries() {
            let stats = per_category.entry(entry.category).or_default();
            stats.entries += 1;
            stats.bytes += entry.size_bytes;
        }

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_bytes = index.total_bytes();

        CacheStats {
            entry_count: index.len(),
            total_bytes,
            max_bytes,
            utilization_pct: if max_bytes > 0 {
                total_bytes as f64 / max_bytes as f64 * 100.0
            } else {
                0.0
            },
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            per_category,
        }
    }
}

// =============================================================================
// File helpers
// =============================================================================

/// Write `bytes` to a temp file beside `path`, then rename over `path`.
/// The temp file is removed on any failure.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = async {
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp file");
            }
        }
        return Err(e.into());
    }
    Ok(())
}

async fn remove_payload(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove cache payload");
        }
    }
}

/// Whether any existing source file was modified after `created_at`
async fn sources_newer_than(source_files: &[PathBuf], created_at: DateTime<Utc>) -> bool {
    for source in source_files {
        let modified: Option<SystemTime> = tokio::fs::metadata(source)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        if let Some(modified) = modified {
            if DateTime::<Utc>::from(modified) > created_at {
                return true;
            }
        }
    }
    false
}

// =============================================================================
// Tests
// =============================================================================
