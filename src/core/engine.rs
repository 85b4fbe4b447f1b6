//! Workflow execution engine.
//!
//! Validates a workflow, plans its dependency phases, and runs them one at
//! a time. Each phase holds a resource lease for exactly as long as its
//! steps run; the lease goes back to the pool on success, failure and
//! cancellation alike.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::StepExecutor;
use crate::domain::{
    EventPayload, ExecutionContext, ExecutionReport, ExecutionStatus, StepResult, StepStatus,
};

use super::circuit_breaker::CircuitBreakerRegistry;
use super::coordinator::{ExecutionCoordinator, FailureResolution, Phase, PhaseScope, StatusBoard};
use super::error::CoreError;
use super::event_bus::EventBus;
use super::resources::{ResourceManager, ResourceRequest};
use super::workflow::{FailurePolicy, RetryPolicy, Step, StepSpec, Workflow};

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step timeout when a step declares none
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Used when a workflow declares no policy
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Mutable state of one execution
struct Run<'a> {
    workflow: &'a Workflow,
    context: ExecutionContext,
    board: StatusBoard,
    results: HashMap<String, StepResult>,
    phases: Vec<Vec<String>>,
}

/// Runs workflows; many executions may be in flight at once
pub struct WorkflowEngine {
    coordinator: ExecutionCoordinator,
    resources: Arc<ResourceManager>,
    events: EventBus,
    config: EngineConfig,
    executions: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl WorkflowEngine {
    pub fn new(
        executors: Vec<Arc<dyn StepExecutor>>,
        breakers: Arc<CircuitBreakerRegistry>,
        resources: Arc<ResourceManager>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            coordinator: ExecutionCoordinator::new(
                executors,
                breakers,
                events.clone(),
                config.step_timeout_ms,
            ),
            resources,
            events,
            config,
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Retry policy for leaf steps that declare none
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.coordinator = self.coordinator.with_retry_policy(policy);
        self
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Validate a workflow and return its phases without running anything
    pub fn plan(&self, workflow: &Workflow) -> Result<Vec<Phase>, CoreError> {
        workflow.validate()?;
        self.coordinator.manage_step_dependencies(&workflow.steps)
    }

    /// Execute with a fresh context seeded from the workflow's variables
    pub async fn execute(&self, workflow: &Workflow) -> Result<ExecutionReport, CoreError> {
        self.execute_with_context(workflow, ExecutionContext::new(&workflow.name))
            .await
    }

    /// Execute against a caller-supplied context.
    ///
    /// Workflow variables fill in whatever the context does not already set.
    /// Only an invalid workflow is an error; step failures and cancellation
    /// are reported through [`ExecutionReport::status`].
    #[instrument(skip(self, workflow, context), fields(workflow = %workflow.name, execution_id = %context.execution_id))]
    pub async fn execute_with_context(
        &self,
        workflow: &Workflow,
        mut context: ExecutionContext,
    ) -> Result<ExecutionReport, CoreError> {
        let phases = self.plan(workflow)?;
        for (name, value) in &workflow.variables {
            if !context.variables.contains_key(name) {
                context.set_variable(name.clone(), value.clone());
            }
        }

        let execution_id = context.execution_id;
        let cancel = CancellationToken::new();
        self.lock_executions().insert(execution_id, cancel.clone());

        let planned: Vec<Vec<String>> = phases.iter().map(|p| p.step_ids.clone()).collect();
        self.events.publish(EventPayload::PhasesPlanned {
            execution_id,
            phases: planned,
        });
        self.events.publish(EventPayload::WorkflowStarted {
            execution_id,
            workflow: workflow.name.clone(),
            phases: phases.len(),
        });
        info!(phases = phases.len(), steps = workflow.steps.len(), "Starting workflow execution");

        let started_at = Utc::now();
        let started = Instant::now();
        let mut run = Run {
            workflow,
            context,
            board: StatusBoard::new(),
            results: HashMap::new(),
            phases: Vec::new(),
        };

        // Dropping the phase future interrupts in-flight steps and releases the lease
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => ExecutionStatus::Cancelled,
            status = self.run_phases(&mut run, &phases, &cancel) => status,
        };
        self.lock_executions().remove(&execution_id);

        let leftover = match status {
            ExecutionStatus::Cancelled => "execution cancelled",
            _ => "execution stopped before this step ran",
        };
        for step in &workflow.steps {
            if run.results.contains_key(step.id()) {
                continue;
            }
            let status = match run.board.status(step.id()) {
                StepStatus::Blocked => StepStatus::Blocked,
                _ => StepStatus::Skipped,
            };
            run.context.set_status(step.id(), status);
            run.results
                .insert(step.id().to_string(), StepResult::not_run(step.id(), status, leftover));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &status {
            ExecutionStatus::Completed => {
                info!(duration_ms, "Workflow completed");
                self.events.publish(EventPayload::WorkflowCompleted {
                    execution_id,
                    workflow: workflow.name.clone(),
                    duration_ms,
                });
            }
            ExecutionStatus::Failed { error } => {
                error!(error = %error, duration_ms, "Workflow failed");
                self.events.publish(EventPayload::WorkflowFailed {
                    execution_id,
                    workflow: workflow.name.clone(),
                    error: error.clone(),
                });
            }
            ExecutionStatus::Cancelled => {
                warn!(duration_ms, "Workflow cancelled");
                self.events.publish(EventPayload::WorkflowCancelled {
                    execution_id,
                    workflow: workflow.name.clone(),
                });
            }
            ExecutionStatus::Running => {}
        }

        Ok(ExecutionReport {
            execution_id,
            workflow: workflow.name.clone(),
            status,
            phases: run.phases,
            step_results: run.results,
            context: run.context,
            started_at,
            completed_at: Some(Utc::now()),
        })
    }

    /// Cancel a running execution.
    ///
    /// Returns false if no execution with that id is running.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.lock_executions().get(&execution_id) {
            Some(token) => {
                info!(%execution_id, "Cancelling execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of executions currently in flight
    pub fn running(&self) -> Vec<Uuid> {
        self.lock_executions().keys().copied().collect()
    }

    async fn run_phases(
        &self,
        run: &mut Run<'_>,
        phases: &[Phase],
        cancel: &CancellationToken,
    ) -> ExecutionStatus {
        let workflow = run.workflow;
        let policy = workflow.failure_policy.unwrap_or(self.config.failure_policy);
        let mut failures: Vec<String> = Vec::new();

        for phase in phases {
            let batch: Vec<&Step> = phase
                .step_ids
                .iter()
                .filter_map(|id| workflow.get_step(id))
                .filter(|step| !run.board.is_terminal(step.id()))
                .collect();
            if batch.is_empty() {
                debug!(phase = phase.index, "Every step in phase already blocked, skipping");
                continue;
            }

            let specs: Vec<&StepSpec> = batch.iter().map(|s| s.spec()).collect();
            let lease = match self
                .resources
                .acquire(ResourceRequest::for_steps(&specs), cancel)
                .await
            {
                Ok(lease) => lease,
                Err(CoreError::Cancelled(_)) => return ExecutionStatus::Cancelled,
                Err(e) => {
                    return ExecutionStatus::Failed {
                        error: e.to_string(),
                    }
                }
            };

            let plan = self
                .resources
                .optimize_allocation(&specs, &lease.allocation().granted);
            let workers = plan.max_concurrency.min(lease.workers()).max(1);
            let rank: HashMap<&str, usize> = plan
                .order
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            let mut ordered = batch;
            ordered.sort_by_key(|s| rank.get(s.id()).copied().unwrap_or(usize::MAX));
            let step_ids: Vec<String> = ordered.iter().map(|s| s.id().to_string()).collect();

            debug!(
                phase = phase.index,
                strategy = ?plan.strategy,
                workers,
                steps = ?step_ids,
                "Running phase"
            );

            let (results, resolution) = {
                let scope = PhaseScope {
                    phase: phase.index,
                    all_steps: &workflow.steps,
                    context: &run.context,
                    workers,
                    board: &run.board,
                };

                let outcome = self
                    .coordinator
                    .coordinate_parallel_execution(&scope, &ordered)
                    .await;
                if self
                    .coordinator
                    .synchronize_steps(&run.board, &step_ids, cancel)
                    .await
                    .is_err()
                {
                    return ExecutionStatus::Cancelled;
                }

                let failed = outcome.failed_ids();
                let mut results = outcome.results;
                let resolution = if failed.is_empty() {
                    FailureResolution::Recovered
                } else {
                    self.coordinator
                        .handle_parallel_failures(&scope, policy, failed, &mut results)
                        .await
                };
                (results, resolution)
            };
            lease.release();

            run.phases.push(step_ids);
            for (id, result) in results {
                run.context.absorb(&result);
                if !result.success {
                    failures.push(format!(
                        "step '{}' failed: {}",
                        id,
                        result.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                run.results.insert(id, result);
            }

            match resolution {
                FailureResolution::Recovered => {}
                FailureResolution::Continue { blocked } => {
                    self.mark_blocked(run, &blocked);
                }
                FailureResolution::Stop { blocked } => {
                    self.mark_blocked(run, &blocked);
                    return ExecutionStatus::Failed {
                        error: failures.join("; "),
                    };
                }
            }
        }

        if failures.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed {
                error: failures.join("; "),
            }
        }
    }

    fn mark_blocked(&self, run: &mut Run<'_>, blocked: &[String]) {
        let unique: HashSet<&String> = blocked.iter().collect();
        for id in unique {
            run.context.set_status(id.clone(), StepStatus::Blocked);
            run.results.insert(
                id.clone(),
                StepResult::not_run(id.clone(), StepStatus::Blocked, "a dependency failed"),
            );
        }
    }

    fn lock_executions(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.executions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
