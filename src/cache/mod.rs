//! Persistent Result Cache
//!
//! Content-addressed, file-backed key/value store with per-entry TTL and
//! size-bounded LRU eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Cache Store                                     │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  key = sha256(category ␀ identifier ␀ canonical_json(params))[..32]      │
//! │                                                                          │
//! │  ┌────────────────────┐        ┌─────────────────────────────────────┐   │
//! │  │ CacheIndex (lock)  │        │ <cache_dir>/                        │   │
//! │  │ key -> CacheEntry  │ ─────▶ │   signals/<key>.json                │   │
//! │  │ total_bytes        │        │   portfolios/<key>.json             │   │
//! │  └────────────────────┘        │   computations/<key>.json           │   │
//! │           │                    │   precomputed/<key>.json            │   │
//! │           ▼                    │   cache_index.json                  │   │
//! │  EvictionPolicy (LRU between   └─────────────────────────────────────┘   │
//! │  high/low watermarks)                                                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Semantics
//!
//! - `put` overwrites; the last writer wins
//! - expired entries are discovered lazily on read and deleted
//! - a missing payload file drops the entry
//! - a source file modified after `created_at` turns a hit into a miss
//! - eviction runs after every `put`, never evicting the entry just written

mod entry;
mod index;
mod key;
mod policy;
mod store;

pub use entry::{CacheCategory, CacheEntry};
pub use index::{CacheIndex, INDEX_FILE};
pub use key::{canonical_json, derive_key, hash_parts, KEY_HEX_LEN};
pub use policy::EvictionPolicy;
pub use store::{CacheConfig, CacheStats, CacheStore, CategoryStats};
pub(crate) use store::write_atomic;
