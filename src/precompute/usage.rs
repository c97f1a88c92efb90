//! Request usage tracking
//!
//! A bounded request log plus a frequency count per combination signature.
//! A combination is forgotten once its last request rotates out of the log,
//! so the tracked set never exceeds the log capacity. The signature is
//! derived the same way as a cache key, so the same request always lands on
//! the same precomputed entry.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{canonical_json, hash_parts};
use crate::error::{Error, Result};

const USAGE_VERSION: u32 = 1;

/// Signature of a `(strategy type, identity, timeframe, params)` combination
pub fn combination_signature(
    strategy_type: &str,
    identity: &str,
    timeframe: &str,
    params: &Value,
) -> Result<String> {
    if strategy_type.trim().is_empty() {
        return Err(Error::validation("strategy_type", "must not be empty"));
    }
    if identity.trim().is_empty() {
        return Err(Error::validation("identity", "must not be empty"));
    }
    let canonical = canonical_json(params)?;
    Ok(hash_parts(&[strategy_type, identity, timeframe, &canonical]))
}

/// One tracked request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub signature: String,
    pub strategy_type: String,
    pub identity: String,
    pub timeframe: String,
    pub params: Value,
    pub duration_ms: f64,
    pub result_size_mb: f64,
    pub timestamp: DateTime<Utc>,
}

/// A frequently requested combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterCombination {
    pub signature: String,
    pub strategy_type: String,
    pub identity: String,
    pub timeframe: String,
    pub params: Value,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    /// Timing of the most recent matching request
    pub last_duration_ms: f64,
    /// Result size of the most recent matching request
    pub last_result_size_mb: f64,
}

#[derive(Serialize)]
struct UsageDocumentRef<'a> {
    version: u32,
    counts: HashMap<&'a str, u64>,
    requests: &'a VecDeque<RequestRecord>,
}

#[derive(Deserialize)]
struct UsageDocumentRaw {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    counts: HashMap<String, u64>,
    #[serde(default)]
    requests: Vec<Value>,
}

/// Per-signature state, alive while the signature has records in the log
#[derive(Debug)]
struct Tracked {
    count: u64,
    in_log: usize,
    latest: RequestRecord,
}

/// Request log and frequency counts
#[derive(Debug)]
pub struct UsageTracker {
    capacity: usize,
    requests: VecDeque<RequestRecord>,
    combinations: HashMap<String, Tracked>,
}

impl UsageTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            requests: VecDeque::new(),
            combinations: HashMap::new(),
        }
    }

    /// Append a request, dropping the oldest past capacity
    pub fn track(&mut self, record: RequestRecord) {
        while self.requests.len() >= self.capacity {
            self.evict_oldest();
        }
        match self.combinations.get_mut(&record.signature) {
            Some(tracked) => {
                tracked.count += 1;
                tracked.in_log += 1;
                tracked.latest = record.clone();
            }
            None => {
                self.combinations.insert(
                    record.signature.clone(),
                    Tracked {
                        count: 1,
                        in_log: 1,
                        latest: record.clone(),
                    },
                );
            }
        }
        self.requests.push_back(record);
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self.requests.pop_front() else {
            return;
        };
        let forget = match self.combinations.get_mut(&oldest.signature) {
            Some(tracked) => {
                tracked.in_log = tracked.in_log.saturating_sub(1);
                tracked.in_log == 0
            }
            None => false,
        };
        if forget {
            self.combinations.remove(&oldest.signature);
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn distinct_combinations(&self) -> usize {
        self.combinations.len()
    }

    pub fn count(&self, signature: &str) -> u64 {
        self.combinations
            .get(signature)
            .map(|tracked| tracked.count)
            .unwrap_or(0)
    }

    /// Most frequent combinations with at least `min_requests` occurrences.
    ///
    /// Ties go to the most recently accessed. Details come from the most
    /// recent request for each combination.
    pub fn top(&self, limit: usize, min_requests: u64) -> Vec<ParameterCombination> {
        let mut candidates: Vec<ParameterCombination> = self
            .combinations
            .iter()
            .filter(|(_, tracked)| tracked.count >= min_requests)
            .map(|(signature, tracked)| {
                let latest = &tracked.latest;
                ParameterCombination {
                    signature: signature.clone(),
                    strategy_type: latest.strategy_type.clone(),
                    identity: latest.identity.clone(),
                    timeframe: latest.timeframe.clone(),
                    params: latest.params.clone(),
                    access_count: tracked.count,
                    last_accessed: latest.timestamp,
                    last_duration_ms: latest.duration_ms,
                    last_result_size_mb: latest.result_size_mb,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| b.last_accessed.cmp(&a.last_accessed))
                .then_with(|| a.signature.cmp(&b.signature))
        });
        candidates.truncate(limit);
        candidates
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let doc = UsageDocumentRef {
            version: USAGE_VERSION,
            counts: self
                .combinations
                .iter()
                .map(|(signature, tracked)| (signature.as_str(), tracked.count))
                .collect(),
            requests: &self.requests,
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    /// Load from `path`; a missing or corrupt file yields an empty tracker
    pub async fn load(path: &Path, capacity: usize) -> Self {
        let mut tracker = Self::new(capacity);
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No usage state found, starting empty");
                return tracker;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read usage state, starting empty");
                return tracker;
            }
        };

        let doc: UsageDocumentRaw = match serde_json::from_slice(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt usage state, starting empty");
                return tracker;
            }
        };
        if doc.version != USAGE_VERSION {
            warn!(found = doc.version, expected = USAGE_VERSION, "Usage state version mismatch");
        }

        let mut dropped = 0usize;
        for value in doc.requests {
            match serde_json::from_value::<RequestRecord>(value) {
                Ok(record) => tracker.track(record),
                Err(_) => dropped += 1,
            }
        }
        // replay counted only the logged requests; restore the saved totals
        for (signature, tracked) in tracker.combinations.iter_mut() {
            if let Some(&saved) = doc.counts.get(signature) {
                tracked.count = tracked.count.max(saved);
            }
        }
        if dropped > 0 {
            warn!(dropped, "Discarded undecodable usage records");
        }
        debug!(
            requests = tracker.requests.len(),
            combinations = tracker.combinations.len(),
            "Loaded usage state"
        );
        tracker
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(strategy: &str, identity: &str, params: Value) -> RequestRecord {
        RequestRecord {
            signature: combination_signature(strategy, identity, "D", &params).unwrap(),
            strategy_type: strategy.to_string(),
            identity: identity.to_string(),
            timeframe: "D".to_string(),
            params,
            duration_ms: 120.0,
            result_size_mb: 0.5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_signature_ignores_param_order() {
        let a = combination_signature("sma", "AAPL", "D", &json!({"fast": 20, "slow": 50})).unwrap();
        let b = combination_signature("sma", "AAPL", "D", &json!({"slow": 50, "fast": 20})).unwrap();
        let c = combination_signature("sma", "AAPL", "W", &json!({"fast": 20, "slow": 50})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(combination_signature("", "AAPL", "D", &json!({})).is_err());
    }

    #[test]
    fn test_top_orders_by_count_and_filters() {
        let mut tracker = UsageTracker::new(100);
        for _ in 0..5 {
            tracker.track(record("sma", "AAPL", json!({"fast": 20})));
        }
        for _ in 0..3 {
            tracker.track(record("sma", "MSFT", json!({"fast": 20})));
        }
        tracker.track(record("rsi", "AAPL", json!({})));

        let top = tracker.top(10, 3);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].identity, "AAPL");
        assert_eq!(top[0].access_count, 5);
        assert_eq!(top[1].access_count, 3);

        assert_eq!(tracker.top(1, 1).len(), 1);
        assert_eq!(tracker.distinct_combinations(), 3);
    }

    #[test]
    fn test_top_reports_latest_observation() {
        let mut tracker = UsageTracker::new(100);
        let mut first = record("sma", "AAPL", json!({}));
        first.duration_ms = 10.0;
        let mut second = first.clone();
        second.duration_ms = 99.0;
        second.result_size_mb = 2.0;
        tracker.track(first);
        tracker.track(second);

        let top = tracker.top(1, 1);
        assert_eq!(top[0].last_duration_ms, 99.0);
        assert_eq!(top[0].last_result_size_mb, 2.0);
    }

    #[test]
    fn test_rotated_out_combinations_are_forgotten() {
        let mut tracker = UsageTracker::new(3);
        for i in 0..5 {
            tracker.track(record("sma", &format!("SYM{}", i), json!({})));
        }
        assert_eq!(tracker.request_count(), 3);
        assert_eq!(tracker.distinct_combinations(), 3);
        assert_eq!(tracker.count(&record("sma", "SYM0", json!({})).signature), 0);
        assert!(tracker.top(10, 1).iter().all(|c| c.identity != "SYM0"));
    }

    #[test]
    fn test_count_survives_while_combination_stays_logged() {
        let mut tracker = UsageTracker::new(3);
        for _ in 0..4 {
            tracker.track(record("sma", "AAPL", json!({})));
        }
        tracker.track(record("sma", "MSFT", json!({})));

        // two AAPL records left in the log, all four counted
        let top = tracker.top(1, 1);
        assert_eq!(top[0].identity, "AAPL");
        assert_eq!(top[0].access_count, 4);
    }

    #[test]
    fn test_many_distinct_combinations_stay_bounded() {
        let capacity = 1_000;
        let mut tracker = UsageTracker::new(capacity);
        for i in 0..(capacity * 4) {
            tracker.track(record("sma", "AAPL", json!({ "fast": i })));
        }
        assert_eq!(tracker.request_count(), capacity);
        assert_eq!(tracker.distinct_combinations(), capacity);

        let started = std::time::Instant::now();
        let top = tracker.top(20, 1);
        assert_eq!(top.len(), 20);
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_load_round_trip_and_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");

        let mut tracker = UsageTracker::new(10);
        tracker.track(record("sma", "AAPL", json!({"fast": 20})));
        tracker.track(record("sma", "AAPL", json!({"fast": 20})));
        std::fs::write(&path, tracker.to_json().unwrap()).unwrap();

        let loaded = UsageTracker::load(&path, 10).await;
        assert_eq!(loaded.request_count(), 2);
        assert_eq!(loaded.top(1, 2)[0].access_count, 2);

        std::fs::write(&path, b"{ not json").unwrap();
        let empty = UsageTracker::load(&path, 10).await;
        assert_eq!(empty.request_count(), 0);

        let missing = UsageTracker::load(&dir.path().join("nope.json"), 10).await;
        assert_eq!(missing.distinct_combinations(), 0);
    }
}
