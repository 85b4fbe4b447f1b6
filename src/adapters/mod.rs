//! Contracts for external systems.
//!
//! The core never implements these itself; hosts plug in their own. A few
//! built-in implementations live alongside for the CLI and for tests:
//! a shell/echo step executor, a component health registry with a fault
//! detector on top, and a history-based strategy recommender.

pub mod analytics;
pub mod command;
pub mod health;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::workflow::LeafStep;
use crate::domain::{ExecutionContext, HealthReport, SystemFailure};

pub use analytics::{HistoryRecommender, PerformanceReport, StrategyStats};
pub use command::CommandExecutor;
pub use health::{ComponentHealthMonitor, HealthFaultDetector};

/// Runs leaf step actions
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Executor name; also the default circuit breaker key
    fn name(&self) -> &str;

    /// Whether this executor handles the step's action
    fn can_execute(&self, step: &LeafStep) -> bool;

    /// Run the step and return its output.
    ///
    /// `timeout` is advisory; the caller enforces it regardless.
    async fn execute(
        &self,
        step: &LeafStep,
        context: &ExecutionContext,
        timeout: Duration,
    ) -> Result<Value>;
}

/// A component that can report its own health
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    async fn health_check(&self) -> Result<HealthReport>;
}

/// Answers "is this service healthy right now"
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn check_service(&self, service: &str) -> Result<HealthReport>;
}

/// Produces failures from whatever it observes
#[async_trait]
pub trait FaultDetector: Send + Sync {
    async fn detect(&self) -> Result<Vec<SystemFailure>>;
}

/// Chooses a recovery strategy and learns from outcomes
#[async_trait]
pub trait StrategyRecommender: Send + Sync {
    /// Strategy name for a failure, e.g. `restart_service`
    async fn recommend(&self, failure: &SystemFailure) -> Result<String>;

    async fn record_outcome(
        &self,
        failure: &SystemFailure,
        strategy: &str,
        success: bool,
    ) -> Result<()>;
}

/// Rolls a service back to a known-good state
#[async_trait]
pub trait RollbackExecutor: Send + Sync {
    /// Returns an id identifying the rollback
    async fn rollback(&self, service: &str, failure: &SystemFailure) -> Result<String>;
}

/// Concrete remediation calls against the platform
#[async_trait]
pub trait Infrastructure: Send + Sync {
    async fn restart_service(&self, service: &str) -> Result<()>;

    async fn scale(&self, service: &str, factor: f64) -> Result<()>;

    async fn failover(&self, service: &str) -> Result<()>;

    async fn adjust_thresholds(&self, service: &str, factor: f64) -> Result<()>;

    async fn schedule_maintenance(&self, service: &str, in_minutes: u64) -> Result<()>;
}
