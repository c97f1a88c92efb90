//! Cache Metadata Index
//!
//! In-memory map of key -> [`CacheEntry`] plus a running byte total,
//! persisted as a single JSON document next to the payload directories.
//!
//! Loading is tolerant: entries are decoded one at a time, and anything that
//! fails to decode or whose payload file is gone is dropped with a warning.
//! A missing or unreadable index file yields an empty index.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::entry::{CacheCategory, CacheEntry};
use crate::error::Result;

/// Index file name inside the cache directory
pub const INDEX_FILE: &str = "cache_index.json";

/// Current on-disk index format version
const INDEX_VERSION: u32 = 1;

#[derive(Serialize)]
struct IndexDocumentRef<'a> {
    version: u32,
    entries: &'a HashMap<String, CacheEntry>,
}

#[derive(Deserialize)]
struct IndexDocumentRaw {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: HashMap<String, Value>,
}

/// Key -> entry map with byte accounting
#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

impl CacheIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index from `path`, discarding anything unusable
    pub async fn load(path: &Path) -> Self {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache index found, starting empty");
                return Self::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cache index, starting empty");
                return Self::new();
            }
        };

        let doc: IndexDocumentRaw = match serde_json::from_slice(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache index, starting empty");
                return Self::new();
            }
        };

        if doc.version != INDEX_VERSION {
            warn!(
                found = doc.version,
                expected = INDEX_VERSION,
                "Cache index version mismatch, attempting per-entry load"
            );
        }

        let mut index = Self::new();
        let mut dropped = 0usize;
        for (key, value) in doc.entries {
            let entry: CacheEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(key = %key, error = %e, "Dropping undecodable cache index entry");
                    dropped += 1;
                    continue;
                }
            };
            if entry.key != key {
                dropped += 1;
                continue;
            }
            if !tokio::fs::try_exists(&entry.storage_path).await.unwrap_or(false) {
                debug!(key = %key, "Dropping cache index entry with missing payload");
                dropped += 1;
                continue;
            }
            index.insert(entry);
        }

        if dropped > 0 {
            warn!(dropped, kept = index.len(), "Discarded unusable cache index entries");
        }
        index
    }

    /// Serialize the index document
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let doc = IndexDocumentRef {
            version: INDEX_VERSION,
            entries: &self.entries,
        };
        Ok(serde_json::to_vec_pretty(&doc)?)
    }

    /// Insert or replace an entry, returning the replaced one
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_bytes += entry.size_bytes;
        let previous = self.entries.insert(entry.key.clone(), entry);
        if let Some(prev) = &previous {
            self.total_bytes = self.total_bytes.saturating_sub(prev.size_bytes);
        }
        previous
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        }
        removed
    }

    /// Look up an entry
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Look up an entry mutably
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Iterate entries
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Keys in a category
    pub fn keys_in(&self, category: CacheCategory) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.category == category)
            .map(|e| e.key.clone())
            .collect()
    }

    /// Remove every entry
    pub fn drain(&mut self) -> Vec<CacheEntry> {
        self.total_bytes = 0;
        self.entries.drain().map(|(_, e)| e).collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of payload sizes
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn entry_at(dir: &Path, key: &str, size: u64) -> CacheEntry {
        let path = dir.join(format!("{}.json", key));
        std::fs::write(&path, vec![b'x'; size as usize]).unwrap();
        let now = Utc::now();
        CacheEntry {
            key: key.to_string(),
            category: CacheCategory::Signals,
            identifier: "AAPL".to_string(),
            storage_path: path,
            created_at: now,
            last_accessed_at: now,
            size_bytes: size,
            ttl: Duration::from_secs(60),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_byte_accounting_on_replace_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = CacheIndex::new();

        index.insert(entry_at(dir.path(), "a", 10));
        index.insert(entry_at(dir.path(), "b", 5));
        assert_eq!(index.total_bytes(), 15);

        index.insert(entry_at(dir.path(), "a", 3));
        assert_eq!(index.total_bytes(), 8);
        assert_eq!(index.len(), 2);

        index.remove("b");
        index.remove("b");
        assert_eq!(index.total_bytes(), 3);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::load(&dir.path().join(INDEX_FILE)).await;
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_load_garbage_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        std::fs::write(&path, b"{not json").unwrap();
        assert!(CacheIndex::load(&path).await.is_empty());
    }

    #[tokio::test]
    async fn test_load_drops_bad_entries_keeps_good() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = CacheIndex::new();
        index.insert(entry_at(dir.path(), "good", 4));
        let orphan = entry_at(dir.path(), "orphan", 4);
        std::fs::remove_file(&orphan.storage_path).unwrap();
        index.insert(orphan);

        let mut doc: Value = serde_json::from_slice(&index.to_json().unwrap()).unwrap();
        doc["entries"]["broken"] = serde_json::json!({"key": "broken", "size_bytes": "lots"});

        let path = dir.path().join(INDEX_FILE);
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let loaded = CacheIndex::load(&path).await;
        assert_eq!(loaded.len(), 1);
        assert!(loaded.get("good").is_some());
        assert_eq!(loaded.total_bytes(), 4);
    }
}
