//! Failure, health and prediction records.
//!
//! These are produced outside the core (fault detection, health checks,
//! predictive analytics) and consumed by the self-healing orchestrator.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of a detected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Unavailable,
    HighErrorRate,
    HighLatency,
    ResourceExhaustion,
    DependencyFailure,
    ConfigError,
    SecurityBreach,
    DataCorruption,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::HighErrorRate => "high_error_rate",
            Self::HighLatency => "high_latency",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::DependencyFailure => "dependency_failure",
            Self::ConfigError => "config_error",
            Self::SecurityBreach => "security_breach",
            Self::DataCorruption => "data_corruption",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity bucket of a failure, derived from its impact score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Bucket an impact score in `[0, 1]`
    pub fn from_impact(impact: f64) -> Self {
        if impact >= 0.8 {
            Self::Critical
        } else if impact >= 0.6 {
            Self::High
        } else if impact >= 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// A detected failure of one service.
///
/// Immutable once created; the orchestrator consumes each failure once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemFailure {
    pub id: Uuid,

    #[serde(rename = "type")]
    pub failure_type: FailureType,

    /// Affected service (the key for recovery bookkeeping)
    pub service: String,

    pub severity: Severity,

    /// Impact score in `[0, 1]`
    pub impact: f64,

    /// Metric readings that triggered detection
    #[serde(default)]
    pub metrics: HashMap<String, f64>,

    pub timestamp: DateTime<Utc>,
}

impl SystemFailure {
    /// Create a failure whose severity is derived from `impact`
    pub fn new(service: impl Into<String>, failure_type: FailureType, impact: f64) -> Self {
        let impact = impact.clamp(0.0, 1.0);
        Self {
            id: Uuid::new_v4(),
            failure_type,
            service: service.into(),
            severity: Severity::from_impact(impact),
            impact,
            metrics: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Health state reported by a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a single health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,

    #[serde(default)]
    pub error_count: u64,

    #[serde(default)]
    pub details: serde_json::Value,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            error_count: 0,
            details: serde_json::Value::Null,
        }
    }

    pub fn unhealthy(error_count: u64, reason: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            error_count,
            details: serde_json::json!({ "reason": reason.into() }),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Preventive remediation suggested by predictive analytics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum PreventiveAction {
    /// Scale the service's resources by `factor`
    ScaleResources { factor: f64 },

    /// Loosen (or tighten) alerting thresholds by `factor`
    AdjustThresholds { factor: f64 },

    /// Schedule a maintenance window starting `in_minutes` from now
    ScheduleMaintenance { in_minutes: u64 },
}

/// A forecast that a service is likely to fail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionAlert {
    pub service: String,

    /// Probability of failure in `[0, 1]`
    pub probability: f64,

    #[serde(default)]
    pub recommended_actions: Vec<PreventiveAction>,

    pub timestamp: DateTime<Utc>,
}

impl PredictionAlert {
    pub fn new(service: impl Into<String>, probability: f64) -> Self {
        Self {
            service: service.into(),
            probability,
            recommended_actions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: PreventiveAction) -> Self {
        self.recommended_actions.push(action);
        self
    }
}

/// A recurring shape in recent failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "pattern")]
pub enum FailurePattern {
    /// The same failure type keeps coming back at short intervals
    RecurringFailure {
        failure_type: FailureType,
        average_interval_secs: f64,
        frequency: usize,
    },

    /// One service accounts for many recent failures
    ComponentHotspot {
        service: String,
        failure_count: usize,
        failure_types: Vec<FailureType>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_buckets() {
        assert_eq!(Severity::from_impact(0.1), Severity::Low);
        assert_eq!(Severity::from_impact(0.4), Severity::Medium);
        assert_eq!(Severity::from_impact(0.65), Severity::High);
        assert_eq!(Severity::from_impact(0.95), Severity::Critical);
    }

    #[test]
    fn test_failure_impact_is_clamped() {
        let failure = SystemFailure::new("api", FailureType::HighLatency, 3.0);
        assert_eq!(failure.impact, 1.0);
        assert_eq!(failure.severity, Severity::Critical);
    }

    #[test]
    fn test_failure_serializes_type_field() {
        let failure = SystemFailure::new("api", FailureType::HighErrorRate, 0.5)
            .with_metric("error_rate", 0.3);
        let json = serde_json::to_value(&failure).unwrap();

        assert_eq!(json["type"], "high_error_rate");
        assert_eq!(json["severity"], "medium");
        assert_eq!(json["metrics"]["error_rate"], 0.3);
    }
}
