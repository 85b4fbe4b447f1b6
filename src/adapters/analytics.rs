//! Strategy recommendation from recorded recovery outcomes.
//!
//! Each failure type has an ordered list of candidate strategies. Until a
//! candidate has enough recorded attempts the list order is trusted; after
//! that the candidate with the best success rate wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{FailureType, SystemFailure};

use super::StrategyRecommender;

/// Attempts before a candidate's success rate is trusted
const MIN_ATTEMPTS: u32 = 5;

/// Success rate below which the next candidate is tried instead
const SUCCESS_RATE_THRESHOLD: f64 = 0.7;

/// Candidate strategies per failure type, most preferred first
pub fn default_strategies(failure_type: FailureType) -> &'static [&'static str] {
    match failure_type {
        FailureType::Unavailable => &["restart_service", "failover", "scale_up"],
        FailureType::HighErrorRate => &["circuit_breaker", "rollback", "restart_service"],
        FailureType::HighLatency => &["scale_up", "circuit_breaker", "failover"],
        FailureType::ResourceExhaustion => &["scale_up", "restart_service"],
        FailureType::DependencyFailure => &["circuit_breaker", "failover"],
        FailureType::ConfigError => &["rollback", "restart_service"],
        FailureType::SecurityBreach => &["failover", "circuit_breaker"],
        FailureType::DataCorruption => &["rollback", "failover"],
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub attempts: u32,
    pub successes: u32,
}

impl StrategyStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    fn is_trusted(&self) -> bool {
        self.attempts >= MIN_ATTEMPTS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

impl SystemStatus {
    pub fn from_success_rate(rate: f64) -> Self {
        if rate > 0.8 {
            Self::Healthy
        } else if rate > 0.5 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub total_attempts: u32,
    pub successes: u32,
    pub overall_success_rate: f64,
    pub status: SystemStatus,

    /// Keyed `<failure_type>/<strategy>`
    pub strategies: BTreeMap<String, StrategyStats>,
}

/// [`StrategyRecommender`] that learns from outcomes
#[derive(Default)]
pub struct HistoryRecommender {
    stats: Mutex<HashMap<(FailureType, String), StrategyStats>>,
}

impl HistoryRecommender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a strategy for a failure type from what has been recorded so far
    pub fn choose(&self, failure_type: FailureType) -> &'static str {
        let candidates = default_strategies(failure_type);
        let stats = self.lock();
        let stat = |name: &str| {
            stats
                .get(&(failure_type, name.to_string()))
                .copied()
                .unwrap_or_default()
        };

        let best_trusted = candidates
            .iter()
            .copied()
            .filter(|name| stat(*name).is_trusted())
            .max_by(|a, b| stat(*a).success_rate().total_cmp(&stat(*b).success_rate()));

        if let Some(best) = best_trusted {
            if stat(best).success_rate() >= SUCCESS_RATE_THRESHOLD {
                return best;
            }
        }

        // Prefer a candidate not yet shown to be poor
        candidates
            .iter()
            .copied()
            .find(|name| {
                let s = stat(*name);
                !s.is_trusted() || s.success_rate() >= SUCCESS_RATE_THRESHOLD
            })
            .or(best_trusted)
            .unwrap_or(candidates[0])
    }

    pub fn stats(&self, failure_type: FailureType, strategy: &str) -> StrategyStats {
        self.lock()
            .get(&(failure_type, strategy.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn performance_report(&self) -> PerformanceReport {
        let stats = self.lock();
        let total_attempts: u32 = stats.values().map(|s| s.attempts).sum();
        let successes: u32 = stats.values().map(|s| s.successes).sum();
        let overall_success_rate = if total_attempts == 0 {
            0.0
        } else {
            successes as f64 / total_attempts as f64
        };

        PerformanceReport {
            total_attempts,
            successes,
            overall_success_rate,
            status: SystemStatus::from_success_rate(overall_success_rate),
            strategies: stats
                .iter()
                .map(|((failure_type, strategy), s)| (format!("{}/{}", failure_type, strategy), *s))
                .collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(FailureType, String), StrategyStats>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StrategyRecommender for HistoryRecommender {
    async fn recommend(&self, failure: &SystemFailure) -> Result<String> {
        let strategy = self.choose(failure.failure_type);
        debug!(
            service = %failure.service,
            failure_type = %failure.failure_type,
            strategy,
            "Strategy recommended"
        );
        Ok(strategy.to_string())
    }

    async fn record_outcome(
        &self,
        failure: &SystemFailure,
        strategy: &str,
        success: bool,
    ) -> Result<()> {
        let mut stats = self.lock();
        let entry = stats
            .entry((failure.failure_type, strategy.to_string()))
            .or_default();
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        }
        Ok(())
    }
}
