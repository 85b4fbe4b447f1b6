//! Core orchestration logic.
//!
//! This module contains:
//! - CircuitBreaker: per-component failure isolation
//! - ResourceManager: the worker/cpu/memory pool
//! - ConditionEvaluator and branch navigation for conditional steps
//! - ExecutionCoordinator: dependency phases and parallel execution
//! - WorkflowEngine: top-level workflow execution
//! - RecoveryManager and SelfHealingOrchestrator: failure recovery
//! - FailureLog: failure history and pattern detection
//! - EventBus and EventLog: event fan-out and persistence

pub mod circuit_breaker;
pub mod condition;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod event_log;
pub mod healing;
pub mod navigator;
pub mod patterns;
pub mod recovery;
pub mod resources;
pub mod workflow;

// Re-export commonly used types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitMetrics, CircuitSnapshot,
};
pub use condition::{Condition, ConditionEvaluator, Evaluation, Operator, ValidationIssue};
pub use coordinator::{
    plan_phases, ExecutionCoordinator, FailureResolution, ParallelOutcome, Phase, StatusBoard,
};
pub use engine::{EngineConfig, WorkflowEngine};
pub use error::CoreError;
pub use event_bus::{EventBus, EventSink, MemorySink};
pub use event_log::EventLog;
pub use healing::{
    HandleOutcome, HealingConfig, RecoveryReport, SelfHealingOrchestrator, ShutdownReport,
};
pub use navigator::select_branch;
pub use patterns::FailureLog;
pub use recovery::{ActionOutcome, RecoveryManager, RecoveryOutcome, RecoveryStrategy};
pub use resources::{
    AllocationPlan, AllocationStrategy, Capacity, ResourceAllocation, ResourceLease,
    ResourceManager, ResourceRequest,
};
pub use workflow::{
    Branch, ConditionalStep, FailurePolicy, LeafStep, RetryPolicy, Step, StepSpec, Workflow,
};
