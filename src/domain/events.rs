//! Event types published by the core.
//!
//! Every state transition worth observing is published as an [`Event`].
//! Payloads are typed; [`Event::name`] gives the stable dotted name that
//! external dashboards key on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution::StepStatus;
use super::failure::{FailurePattern, FailureType, PreventiveAction};

/// A single published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn name(&self) -> &str {
        self.payload.name()
    }
}

/// Circuit breaker state, as seen in events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Everything the core publishes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    CircuitStateChanged {
        component: String,
        from: CircuitState,
        to: CircuitState,
        failure_count: u32,
    },

    RecoveryStarted {
        recovery_id: Uuid,
        service: String,
        strategy: String,
        failure_type: FailureType,
        #[serde(default)]
        patterns: Vec<FailurePattern>,
    },
    RecoveryCompleted {
        recovery_id: Uuid,
        service: String,
        strategy: String,
        duration_ms: u64,
    },
    RecoveryFailed {
        recovery_id: Uuid,
        service: String,
        strategy: String,
        error: String,
    },
    /// A recovery timed out and needs a human
    EscalationRequired {
        recovery_id: Uuid,
        service: String,
        reason: String,
    },
    RecoveryCancelled {
        recovery_id: Uuid,
        service: String,
    },
    RecoveryIgnored {
        service: String,
        reason: String,
    },
    PreventiveActionDispatched {
        service: String,
        probability: f64,
        action: PreventiveAction,
        success: bool,
    },

    WorkflowStarted {
        execution_id: Uuid,
        workflow: String,
        phases: usize,
    },
    WorkflowCompleted {
        execution_id: Uuid,
        workflow: String,
        duration_ms: u64,
    },
    WorkflowFailed {
        execution_id: Uuid,
        workflow: String,
        error: String,
    },
    WorkflowCancelled {
        execution_id: Uuid,
        workflow: String,
    },

    PhasesPlanned {
        execution_id: Uuid,
        phases: Vec<Vec<String>>,
    },

    StepStarted {
        execution_id: Uuid,
        step_id: String,
    },
    StepFinished {
        execution_id: Uuid,
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
        error: Option<String>,
    },

    ParallelExecutionStarted {
        execution_id: Uuid,
        phase: usize,
        step_ids: Vec<String>,
        workers: usize,
    },
    ParallelExecutionCompleted {
        execution_id: Uuid,
        phase: usize,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
    ParallelRetryAttempt {
        execution_id: Uuid,
        attempt: u32,
        step_ids: Vec<String>,
    },

    ConditionEvaluated {
        step_id: String,
        expression: String,
        result: bool,
    },
    BranchSelected {
        step_id: String,
        branch_id: String,
        depth: u32,
    },

    ResourcesQueued {
        steps: Vec<String>,
        workers: usize,
    },
    ResourcesGranted {
        allocation_id: Uuid,
        workers: usize,
        cpu: f64,
        memory_mb: u64,
    },
    ResourcesReleased {
        allocation_id: Uuid,
        workers: usize,
    },

    /// Open-ended events from hosts or extensions
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl EventPayload {
    /// Stable dotted name for subscribers
    pub fn name(&self) -> &str {
        match self {
            Self::CircuitStateChanged { .. } => "circuit_breaker.state_changed",
            Self::RecoveryStarted { .. } => "recovery.started",
            Self::RecoveryCompleted { .. } => "recovery.completed",
            Self::RecoveryFailed { .. } => "recovery.failed",
            Self::EscalationRequired { .. } => "recovery.escalation_required",
            Self::RecoveryCancelled { .. } => "recovery.cancelled",
            Self::RecoveryIgnored { .. } => "recovery.ignored",
            Self::PreventiveActionDispatched { .. } => "prediction.preventive_action",
            Self::WorkflowStarted { .. } => "workflow.started",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::WorkflowCancelled { .. } => "workflow.cancelled",
            Self::PhasesPlanned { .. } => "workflow.phases_planned",
            Self::StepStarted { .. } => "step.started",
            Self::StepFinished { .. } => "step.finished",
            Self::ParallelExecutionStarted { .. } => "parallel.started",
            Self::ParallelExecutionCompleted { .. } => "parallel.completed",
            Self::ParallelRetryAttempt { .. } => "parallel.retry_attempt",
            Self::ConditionEvaluated { .. } => "condition.evaluated",
            Self::BranchSelected { .. } => "branch.selected",
            Self::ResourcesQueued { .. } => "resources.queued",
            Self::ResourcesGranted { .. } => "resources.granted",
            Self::ResourcesReleased { .. } => "resources.released",
            Self::Custom { name, .. } => name,
        }
    }
}
