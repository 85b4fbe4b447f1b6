//! Strategy dispatch for recoveries and preventive actions.
//!
//! Every remediation call is timed, bounded by the action timeout, and
//! turned into an outcome. Nothing here returns an error for a failed
//! remediation; only an unrecognized strategy name is an error.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::adapters::{Infrastructure, RollbackExecutor};
use crate::domain::{CircuitState, PreventiveAction, SystemFailure};

use super::circuit_breaker::CircuitBreakerRegistry;
use super::error::CoreError;
use super::healing::HealingConfig;

/// Named remediation procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Open the service's breaker so callers stop hammering it
    CircuitBreaker,
    RestartService,
    ScaleUp,
    /// Delegate to the rollback executor
    Rollback,
    Failover,
}

impl RecoveryStrategy {
    pub const ALL: [RecoveryStrategy; 5] = [
        Self::CircuitBreaker,
        Self::RestartService,
        Self::ScaleUp,
        Self::Rollback,
        Self::Failover,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitBreaker => "circuit_breaker",
            Self::RestartService => "restart_service",
            Self::ScaleUp => "scale_up",
            Self::Rollback => "rollback",
            Self::Failover => "failover",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| CoreError::UnknownStrategy(s.to_string()))
    }
}

/// Result of one remediation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of running a recovery strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub strategy: RecoveryStrategy,

    #[serde(flatten)]
    pub action: ActionOutcome,

    /// Set when the strategy was a rollback that succeeded
    pub rollback_id: Option<String>,
}

impl RecoveryOutcome {
    pub fn success(&self) -> bool {
        self.action.success
    }
}

/// Maps strategy names onto infrastructure calls
pub struct RecoveryManager {
    infrastructure: Arc<dyn Infrastructure>,
    rollback: Arc<dyn RollbackExecutor>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: HealingConfig,
}

impl RecoveryManager {
    pub fn new(
        infrastructure: Arc<dyn Infrastructure>,
        rollback: Arc<dyn RollbackExecutor>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: HealingConfig,
    ) -> Self {
        Self {
            infrastructure,
            rollback,
            breakers,
            config,
        }
    }

    /// Scale factor for a failure: grows with impact, capped
    pub fn scale_factor_for(&self, failure: &SystemFailure) -> f64 {
        (self.config.scale_factor * (1.0 + failure.impact)).min(self.config.max_scale_factor)
    }

    /// Run the named strategy for a failure.
    ///
    /// Fails only with [`CoreError::UnknownStrategy`]; remediation failures
    /// come back as an unsuccessful outcome.
    pub async fn execute_strategy(
        &self,
        name: &str,
        failure: &SystemFailure,
    ) -> Result<RecoveryOutcome, CoreError> {
        let strategy: RecoveryStrategy = name.parse()?;
        let service = failure.service.as_str();
        info!(service = %service, strategy = %strategy, "Executing recovery strategy");

        let (action, rollback_id) = match strategy {
            RecoveryStrategy::CircuitBreaker => {
                let outcome = self
                    .timed(strategy.as_str(), async {
                        self.breakers.force_state(service, CircuitState::Open);
                        Ok::<_, anyhow::Error>(())
                    })
                    .await;
                (outcome.0, None)
            }
            RecoveryStrategy::RestartService => {
                let outcome = self
                    .timed(strategy.as_str(), self.infrastructure.restart_service(service))
                    .await;
                (outcome.0, None)
            }
            RecoveryStrategy::ScaleUp => {
                let factor = self.scale_factor_for(failure);
                let outcome = self
                    .timed(strategy.as_str(), self.infrastructure.scale(service, factor))
                    .await;
                (outcome.0, None)
            }
            RecoveryStrategy::Failover => {
                let outcome = self
                    .timed(strategy.as_str(), self.infrastructure.failover(service))
                    .await;
                (outcome.0, None)
            }
            RecoveryStrategy::Rollback => {
                self.timed(strategy.as_str(), self.rollback.rollback(service, failure))
                    .await
            }
        };

        if let Some(error) = &action.error {
            warn!(service = %service, strategy = %strategy, error = %error, "Recovery strategy failed");
        }

        Ok(RecoveryOutcome {
            strategy,
            action,
            rollback_id,
        })
    }

    /// Run one preventive action
    pub async fn execute_preventive(&self, service: &str, action: &PreventiveAction) -> ActionOutcome {
        let what = match action {
            PreventiveAction::ScaleResources { .. } => "scale_resources",
            PreventiveAction::AdjustThresholds { .. } => "adjust_thresholds",
            PreventiveAction::ScheduleMaintenance { .. } => "schedule_maintenance",
        };
        info!(service = %service, action = what, "Executing preventive action");

        let infrastructure = &self.infrastructure;
        let (outcome, _) = match action {
            PreventiveAction::ScaleResources { factor } => {
                let factor = factor.min(self.config.max_scale_factor);
                self.timed(what, infrastructure.scale(service, factor)).await
            }
            PreventiveAction::AdjustThresholds { factor } => {
                self.timed(what, infrastructure.adjust_thresholds(service, *factor))
                    .await
            }
            PreventiveAction::ScheduleMaintenance { in_minutes } => {
                self.timed(what, infrastructure.schedule_maintenance(service, *in_minutes))
                    .await
            }
        };
        outcome
    }

    /// Bound a call by the action timeout and measure it
    async fn timed<T, F>(&self, what: &str, call: F) -> (ActionOutcome, Option<T>)
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let limit = Duration::from_millis(self.config.action_timeout_ms);
        let result = tokio::time::timeout(limit, call).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(value)) => (
                ActionOutcome {
                    success: true,
                    duration_ms,
                    error: None,
                },
                Some(value),
            ),
            Ok(Err(e)) => (
                ActionOutcome {
                    success: false,
                    duration_ms,
                    error: Some(format!("{:#}", e)),
                },
                None,
            ),
            Err(_) => (
                ActionOutcome {
                    success: false,
                    duration_ms,
                    error: Some(
                        CoreError::TimeoutExceeded {
                            what: what.to_string(),
                            elapsed_ms: duration_ms,
                        }
                        .to_string(),
                    ),
                },
                None,
            ),
        }
    }
}
