//! Cache Entry Types

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Cache namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    /// Strategy signal series
    Signals,
    /// Portfolio / backtest results
    Portfolios,
    /// Generic intermediate computations
    Computations,
    /// Results produced ahead of demand by the precompute engine
    Precomputed,
}

impl CacheCategory {
    /// All categories, in directory order
    pub const ALL: [CacheCategory; 4] = [
        CacheCategory::Signals,
        CacheCategory::Portfolios,
        CacheCategory::Computations,
        CacheCategory::Precomputed,
    ];

    /// Directory / wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Signals => "signals",
            CacheCategory::Portfolios => "portfolios",
            CacheCategory::Computations => "computations",
            CacheCategory::Precomputed => "precomputed",
        }
    }
}

impl std::fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signals" => Ok(CacheCategory::Signals),
            "portfolios" => Ok(CacheCategory::Portfolios),
            "computations" => Ok(CacheCategory::Computations),
            "precomputed" => Ok(CacheCategory::Precomputed),
            _ => Err(Error::InvalidCategory(s.to_string())),
        }
    }
}

/// Metadata for one cached value; the payload lives at `storage_path`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Content-derived key
    pub key: String,
    /// Namespace
    pub category: CacheCategory,
    /// Caller-supplied identifier (ticker, strategy id, ...)
    pub identifier: String,
    /// Backing payload file
    pub storage_path: PathBuf,
    /// When the payload was written
    pub created_at: DateTime<Utc>,
    /// Last successful read (or the write)
    pub last_accessed_at: DateTime<Utc>,
    /// Payload size in bytes
    pub size_bytes: u64,
    /// Time to live (zero = never expires)
    #[serde(with = "crate::config::duration_serde")]
    pub ttl: Duration,
    /// Free-form tags
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CacheEntry {
    /// Whether the entry has outlived its TTL at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        (now - self.created_at)
            .to_std()
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }

    /// Whether the entry has outlived its TTL now
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expiry instant, if any
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl.is_zero() {
            return None;
        }
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
    }

    /// Record a successful read
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(ttl: Duration) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: "abc".to_string(),
            category: CacheCategory::Signals,
            identifier: "AAPL".to_string(),
            storage_path: PathBuf::from("/tmp/abc.json"),
            created_at: now,
            last_accessed_at: now,
            size_bytes: 10,
            ttl,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("signals".parse::<CacheCategory>().unwrap(), CacheCategory::Signals);
        assert_eq!(" Precomputed ".parse::<CacheCategory>().unwrap(), CacheCategory::Precomputed);
        assert!(matches!(
            "trades".parse::<CacheCategory>(),
            Err(Error::InvalidCategory(_))
        ));
    }

    #[test]
    fn test_category_display_matches_serde() {
        for category in CacheCategory::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category));
        }
    }

    #[test]
    fn test_expiry_boundaries() {
        let entry = make_entry(Duration::from_secs(60));
        let created = entry.created_at;

        assert!(!entry.is_expired_at(created + chrono::Duration::seconds(59)));
        assert!(entry.is_expired_at(created + chrono::Duration::seconds(61)));
        assert_eq!(entry.expires_at(), Some(created + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let entry = make_entry(Duration::ZERO);
        assert!(!entry.is_expired_at(entry.created_at + chrono::Duration::days(365)));
        assert!(entry.expires_at().is_none());
    }

    #[test]
    fn test_entry_serde_roundtrip() {
        let mut entry = make_entry(Duration::from_millis(1500));
        entry.metadata.insert("source".into(), "backtest".into());

        let json = serde_json::to_string(&entry).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
