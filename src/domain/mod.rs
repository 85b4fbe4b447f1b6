//! Domain types for the mender core.
//!
//! This module contains the core data structures:
//! - Events: typed records of observable state changes
//! - Execution: workflow run state and step results
//! - Failure: failures, health reports and prediction alerts
//! - Recovery: recovery bookkeeping

pub mod events;
pub mod execution;
pub mod failure;
pub mod recovery;

// Re-export commonly used types
pub use events::{CircuitState, Event, EventPayload};
pub use execution::{
    BranchResult, ExecutionContext, ExecutionError, ExecutionReport, ExecutionStatus,
    StepResult, StepStatus,
};
pub use failure::{
    FailurePattern, FailureType, HealthReport, HealthState, PredictionAlert, PreventiveAction, Severity,
    SystemFailure,
};
pub use recovery::{RecoveryAction, RecoveryStatus};
