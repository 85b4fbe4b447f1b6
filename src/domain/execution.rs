//! Execution state of a workflow run.
//!
//! An [`ExecutionContext`] is owned by exactly one execution. Conditional
//! branches run against a clone so that a failing branch cannot leave
//! partial bindings behind.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Not run because the execution stopped first
    Skipped,

    /// Not run because a dependency failed
    Blocked,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// An error recorded against the context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub step_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Variable bindings and accumulated state of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub execution_id: Uuid,

    /// Variables visible to conditions and executors
    pub variables: serde_json::Map<String, Value>,

    /// Outputs of completed steps, addressable as `steps.<id>`
    pub outputs: HashMap<String, Value>,

    pub errors: Vec<ExecutionError>,

    /// Current status of every step seen so far
    pub state: HashMap<String, StepStatus>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: Uuid::new_v4(),
            variables: serde_json::Map::new(),
            outputs: HashMap::new(),
            errors: Vec::new(),
            state: HashMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Resolve a dotted path.
    ///
    /// `steps.<id>.<field>` reads step outputs; anything else reads variables.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;

        let mut current = if head == "steps" {
            let step_id = parts.next()?;
            self.outputs.get(step_id)?
        } else {
            self.variables.get(head)?
        };

        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    pub fn record_error(&mut self, step_id: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ExecutionError {
            step_id: step_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn set_status(&mut self, step_id: impl Into<String>, status: StepStatus) {
        self.state.insert(step_id.into(), status);
    }

    pub fn status(&self, step_id: &str) -> StepStatus {
        self.state.get(step_id).copied().unwrap_or_default()
    }

    /// Fold a finished step (and any branch steps beneath it) into the context.
    ///
    /// Outputs from a failed branch are not kept; statuses and errors are.
    pub fn absorb(&mut self, result: &StepResult) {
        self.absorb_result(result, true);
    }

    fn absorb_result(&mut self, result: &StepResult, keep_outputs: bool) {
        self.set_status(result.step_id.clone(), result.status);
        if let (true, true, Some(output)) = (result.success, keep_outputs, &result.output) {
            self.outputs.insert(result.step_id.clone(), output.clone());
        }
        if let (StepStatus::Failed, Some(error)) = (result.status, &result.error) {
            self.record_error(result.step_id.clone(), error.clone());
        }
        if let Some(branch) = &result.branch {
            for step in &branch.step_results {
                self.absorb_result(step, keep_outputs && branch.success);
            }
        }
    }
}

/// Outcome of one step run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,

    /// Wall-clock time of the run, including per-step retries
    #[serde(with = "duration_ms")]
    pub execution_time: Duration,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Attempts made, including the first
    pub attempts: u32,

    /// Branch outcome for conditional steps
    pub branch: Option<BranchResult>,
}

impl StepResult {
    pub fn succeeded(
        step_id: impl Into<String>,
        output: Value,
        started_at: DateTime<Utc>,
        execution_time: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            execution_time,
            started_at,
            finished_at: Utc::now(),
            attempts: 1,
            branch: None,
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        execution_time: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            success: false,
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            execution_time,
            started_at,
            finished_at: Utc::now(),
            attempts: 1,
            branch: None,
        }
    }

    /// A step that never ran
    pub fn not_run(step_id: impl Into<String>, status: StepStatus, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            success: false,
            status,
            output: None,
            error: Some(reason.into()),
            execution_time: Duration::ZERO,
            started_at: now,
            finished_at: now,
            attempts: 0,
            branch: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Outcome of running one branch of a conditional step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchResult {
    pub branch_id: String,

    /// Nesting depth; the outermost branch is depth 1
    pub depth: u32,

    pub success: bool,

    /// Results of the branch's own steps, in order
    pub step_results: Vec<StepResult>,

    /// Branches taken by conditional steps inside this branch
    pub nested_results: Vec<BranchResult>,
}

impl BranchResult {
    /// Deepest nesting level reached beneath (and including) this branch
    pub fn max_depth(&self) -> u32 {
        self.nested_results
            .iter()
            .map(BranchResult::max_depth)
            .max()
            .unwrap_or(self.depth)
            .max(self.depth)
    }
}

/// Final state of a workflow execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed { error: String },
    Cancelled,
}

/// Everything known about a finished execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub workflow: String,
    pub status: ExecutionStatus,

    /// Step ids per phase, in execution order
    pub phases: Vec<Vec<String>>,

    pub step_results: HashMap<String, StepResult>,
    pub context: ExecutionContext,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
