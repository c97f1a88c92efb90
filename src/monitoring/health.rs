//! Health Checks
//!
//! Liveness/readiness flags plus per-component checks rolled up into one
//! [`HealthResponse`]. The worst component status wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Operational but something needs attention
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Result of one named check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Grade a percentage against degraded/unhealthy thresholds
    pub fn from_percentage(
        name: impl Into<String>,
        value: f64,
        degraded_at: f64,
        unhealthy_at: f64,
    ) -> Self {
        let name = name.into();
        if value >= unhealthy_at {
            Self::unhealthy(name, format!("{:.1}% >= {:.1}%", value, unhealthy_at))
        } else if value >= degraded_at {
            Self::degraded(name, format!("{:.1}% >= {:.1}%", value, degraded_at))
        } else {
            Self::healthy(name)
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Rolled-up health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

/// Liveness/readiness state of the process
pub struct HealthCheck {
    start_time: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthCheck {
    /// Live, not yet ready
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn liveness_check(&self) -> HealthCheckResult {
        if self.is_live() {
            HealthCheckResult::healthy("liveness")
        } else {
            HealthCheckResult::unhealthy("liveness", "Service is shutting down")
        }
    }

    pub fn readiness_check(&self) -> HealthCheckResult {
        if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::unhealthy("readiness", "Service not ready")
        }
    }

    /// Liveness and readiness followed by the given component checks
    pub fn report(&self, components: Vec<HealthCheckResult>) -> HealthResponse {
        let mut checks = vec![self.liveness_check(), self.readiness_check()];
        checks.extend(components);
        HealthResponse::new(checks, self.uptime())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unhealthy.is_operational());
        assert!(HealthStatus::Unhealthy > HealthStatus::Degraded);
    }

    #[test]
    fn test_from_percentage() {
        assert_eq!(
            HealthCheckResult::from_percentage("mem", 50.0, 85.0, 95.0).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthCheckResult::from_percentage("mem", 90.0, 85.0, 95.0).status,
            HealthStatus::Degraded
        );
        let bad = HealthCheckResult::from_percentage("mem", 99.0, 85.0, 95.0);
        assert_eq!(bad.status, HealthStatus::Unhealthy);
        assert!(bad.message.unwrap().contains("99.0%"));
    }

    #[test]
    fn test_worst_status_wins() {
        let response = HealthResponse::new(
            vec![
                HealthCheckResult::healthy("a"),
                HealthCheckResult::degraded("b", "slow"),
            ],
            Duration::from_secs(60),
        );
        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.uptime_seconds, 60);
    }

    #[test]
    fn test_report_includes_liveness_and_readiness() {
        let health = HealthCheck::new();
        let response = health.report(vec![HealthCheckResult::healthy("cache")]);
        assert_eq!(response.checks.len(), 3);
        assert_eq!(response.status, HealthStatus::Unhealthy);

        health.set_ready(true);
        assert_eq!(health.report(Vec::new()).status, HealthStatus::Healthy);

        health.set_live(false);
        assert!(!health.liveness_check().status.is_operational());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&HealthCheckResult::healthy("cache")).unwrap();
        assert!(json.contains("Healthy"));
        let back: HealthCheckResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, HealthStatus::Healthy);
    }
}
