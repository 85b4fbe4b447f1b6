//! Recovery bookkeeping records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::failure::{FailurePattern, SystemFailure};

/// Lifecycle of a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RecoveryStatus {
    /// Completed and failed recoveries are never revisited
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One recovery attempt for one service.
///
/// At most one non-terminal action exists per service at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: Uuid,
    pub service: String,

    /// Strategy name, e.g. `restart_service`
    pub strategy: String,

    pub status: RecoveryStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    /// The failure this action responds to
    pub failure: SystemFailure,

    /// Set when the strategy delegated to a rollback
    pub rollback_id: Option<String>,

    /// Why the action ended `failed`
    pub error: Option<String>,

    /// Patterns seen in recent failures when this one arrived
    #[serde(default)]
    pub patterns: Vec<FailurePattern>,
}

impl RecoveryAction {
    /// Create a pending action for a failure
    pub fn new(failure: SystemFailure) -> Self {
        Self {
            id: Uuid::new_v4(),
            service: failure.service.clone(),
            strategy: String::new(),
            status: RecoveryStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            failure,
            rollback_id: None,
            error: None,
            patterns: Vec::new(),
        }
    }

    pub fn start(&mut self, strategy: impl Into<String>) {
        self.strategy = strategy.into();
        self.status = RecoveryStatus::InProgress;
    }

    pub fn complete(&mut self) {
        self.status = RecoveryStatus::Completed;
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RecoveryStatus::Failed;
        self.error = Some(error.into());
        self.end_time = Some(Utc::now());
    }

    /// Elapsed time in milliseconds (up to now if still running)
    pub fn duration_ms(&self) -> u64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }
}
