//! Layer Configuration
//!
//! Typed configuration for every component. Each component owns its own
//! config struct (next to the component); this module aggregates them,
//! loads them from YAML or JSON and validates cross-field invariants.
//!
//! Unknown keys are rejected at load time.
//!
//! ```yaml
//! cache:
//!   cache_dir: /var/cache/quantcache
//!   max_bytes: 2147483648
//!   default_ttl: 1h
//! worker_pool:
//!   workload: cpu-bound
//!   max_workers: 16
//! auto_tuner:
//!   interval: 30s
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::monitoring::MonitorConfig;
use crate::pool::WorkerPoolConfig;
use crate::precompute::PrecomputeConfig;
use crate::tuner::AutoTunerConfig;

/// Aggregate configuration for the whole layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Cache store settings
    pub cache: CacheConfig,
    /// Resource & performance monitor settings
    pub monitor: MonitorConfig,
    /// Worker pool settings
    pub worker_pool: WorkerPoolConfig,
    /// Auto-tuner settings
    pub auto_tuner: AutoTunerConfig,
    /// Precompute engine settings
    pub precompute: PrecomputeConfig,
}

impl OptimizerConfig {
    /// Parse a YAML document (JSON is valid YAML)
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a `.yaml`/`.yml`/`.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => serde_yaml::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every component config
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.monitor.validate()?;
        self.worker_pool.validate()?;
        self.auto_tuner.validate()?;
        self.precompute.validate()?;
        Ok(())
    }
}

/// Fail with a config error when `condition` is false
pub(crate) fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Config(message()))
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a duration such as `"30s"`, `"5m"`, `"1h30m"`, `"250ms"` or `"45"`
/// (bare numbers are seconds).
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            'd' | 'D' => 86_400_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = add_scaled(total_ms, num, multiplier, s)?;
    }

    // Trailing number without unit is seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = add_scaled(total_ms, num, 1_000, s)?;
    }

    Ok(Duration::from_millis(total_ms))
}

fn add_scaled(total_ms: u64, num: u64, multiplier: u64, input: &str) -> Result<u64> {
    num.checked_mul(multiplier)
        .and_then(|ms| total_ms.checked_add(ms))
        .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", input)))
}

/// Render a duration in the format accepted by [`parse_duration`]
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    if ms % 1_000 != 0 {
        format!("{}ms", ms)
    } else {
        format!("{}s", ms / 1_000)
    }
}

/// Serde adapter for `Duration` fields: strings like `"30s"` or integer seconds
pub mod duration_serde {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkloadClass;

    // =========================================================================
    // parse_duration Tests
    // =========================================================================

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        assert_matches::assert_matches!(
            parse_duration("999999999999999d"),
            Err(Error::DurationParse(_))
        );
        assert_matches::assert_matches!(
            parse_duration("18446744073709552s"),
            Err(Error::DurationParse(_))
        );
        assert!(parse_duration(&format!("{}d{}d", u64::MAX / 86_400_000, u64::MAX / 86_400_000)).is_err());
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_format_duration_roundtrips() {
        for d in [Duration::from_secs(90), Duration::from_millis(1500)] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    // =========================================================================
    // OptimizerConfig Tests
    // =========================================================================

    #[test]
    fn test_default_config_is_valid() {
        OptimizerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
cache:
  max_bytes: 1048576
  default_ttl: 10m
worker_pool:
  workload: io-bound
  min_workers: 2
  max_workers: 8
auto_tuner:
  interval: 15s
  confidence_threshold: 0.8
"#;
        let config = OptimizerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache.max_bytes, 1_048_576);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(600));
        assert_eq!(config.worker_pool.workload, WorkloadClass::IoBound);
        assert_eq!(config.worker_pool.max_workers, 8);
        assert_eq!(config.auto_tuner.interval, Duration::from_secs(15));
        assert_eq!(config.auto_tuner.confidence_threshold, 0.8);
        // untouched sections keep defaults
        assert_eq!(config.precompute.min_requests, 3);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = "cache:\n  max_bytez: 10\n";
        assert!(OptimizerConfig::from_yaml_str(yaml).is_err());

        let yaml = "caches: {}\n";
        assert!(OptimizerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let yaml = "worker_pool:\n  min_workers: 10\n  max_workers: 2\n";
        assert!(matches!(
            OptimizerConfig::from_yaml_str(yaml),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.json");
        std::fs::write(&path, r#"{"precompute": {"top_n": 5, "interval": 60}}"#).unwrap();

        let config = OptimizerConfig::from_file(&path).unwrap();
        assert_eq!(config.precompute.top_n, 5);
        assert_eq!(config.precompute.interval, Duration::from_secs(60));
    }
}
