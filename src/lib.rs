//! mender - self-healing recovery and workflow execution core
//!
//! Two engines share one set of building blocks:
//!
//! - The self-healing orchestrator watches component health, picks a
//!   recovery strategy for each detected failure, executes it, and verifies
//!   the service recovers before a timeout (escalating when it does not).
//! - The workflow engine runs a graph of steps in dependency phases, with
//!   conditional branching and bounded parallelism.
//!
//! Both are protected by per-component circuit breakers and publish every
//! state transition as a typed event.
//!
//! # Modules
//!
//! - `adapters`: Contracts for external systems, plus built-in implementations
//! - `core`: Engines (circuit breaker, resources, coordinator, recovery, healing)
//! - `domain`: Data structures (Event, ExecutionContext, SystemFailure, RecoveryAction)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a workflow
//! mender run deploy.yaml --var cpu=91 --events events.jsonl
//!
//! # Show its dependency phases
//! mender plan deploy.yaml
//!
//! # Replay what happened
//! mender events events.jsonl
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::MenderConfig;
pub use core::{CoreError, EventBus, SelfHealingOrchestrator, Workflow, WorkflowEngine};
pub use domain::{Event, EventPayload, ExecutionReport, SystemFailure};
