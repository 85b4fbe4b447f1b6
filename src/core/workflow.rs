//! Workflow definitions and loading.
//!
//! A workflow is a graph of steps. Leaf steps run an action through a
//! [`StepExecutor`](crate::adapters::StepExecutor); conditional steps
//! evaluate a condition and run the steps of the matching branch, which may
//! themselves be conditional.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::condition::Condition;
use super::error::CoreError;

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Initial variable bindings for the execution context
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,

    /// How a phase with failed steps is handled; the engine default if unset
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,

    /// Top-level steps; ordering comes from `depends_on`, not position
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Load a workflow from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a workflow from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow YAML")
    }

    /// Validate ids, dependency references and acyclicity
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::validation("Workflow name cannot be empty"));
        }

        if self.steps.is_empty() {
            return Err(CoreError::validation("Workflow must have at least one step"));
        }

        let mut seen = HashSet::new();
        collect_ids(&self.steps, &mut seen)?;

        let top_level: HashSet<&str> = self.steps.iter().map(|s| s.id()).collect();
        for step in &self.steps {
            for dep in &step.spec().depends_on {
                if dep == step.id() {
                    return Err(CoreError::validation(format!(
                        "Step '{}' depends on itself",
                        step.id()
                    )));
                }
                if !top_level.contains(dep.as_str()) {
                    return Err(CoreError::validation(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.id(),
                        dep
                    )));
                }
            }
        }

        super::coordinator::plan_phases(&self.steps).map(|_| ())
    }

    /// Get a top-level step by id
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == id)
    }
}

fn collect_ids<'a>(steps: &'a [Step], seen: &mut HashSet<&'a str>) -> Result<(), CoreError> {
    for step in steps {
        if step.id().is_empty() {
            return Err(CoreError::validation("Step id cannot be empty"));
        }
        if !seen.insert(step.id()) {
            return Err(CoreError::validation(format!(
                "Duplicate step id '{}'",
                step.id()
            )));
        }
        if let Step::Conditional(conditional) = step {
            if conditional.branches.is_empty() {
                return Err(CoreError::validation(format!(
                    "Conditional step '{}' has no branches",
                    step.id()
                )));
            }
            for branch in &conditional.branches {
                collect_ids(&branch.steps, seen)?;
            }
        }
    }
    Ok(())
}

/// A workflow step: either a leaf action or a conditional with branches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    #[serde(rename = "action")]
    Leaf(LeafStep),
    Conditional(ConditionalStep),
}

impl Step {
    pub fn id(&self) -> &str {
        &self.spec().id
    }

    pub fn spec(&self) -> &StepSpec {
        match self {
            Step::Leaf(step) => &step.spec,
            Step::Conditional(step) => &step.spec,
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Step::Conditional(_))
    }
}

/// Scheduling attributes shared by every kind of step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step id (unique within the workflow, including branch steps)
    pub id: String,

    /// Tie-breaker among steps that become ready together
    #[serde(default)]
    pub order: u32,

    /// Ids of steps that must reach a terminal status first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// May run concurrently with other ready steps
    #[serde(default)]
    pub parallelizable: bool,

    /// Members of a group always start at the same synchronization point
    #[serde(default)]
    pub parallel_group: Option<String>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default)]
    pub workload: Workload,

    #[serde(default)]
    pub priority: Priority,

    /// Override for the engine's step timeout
    pub timeout_ms: Option<u64>,

    /// Per-step retry for transient failures
    pub retry_policy: Option<RetryPolicy>,

    /// Circuit breaker key; defaults to the step id. Steps naming the same
    /// component share one breaker.
    pub component: Option<String>,
}

impl StepSpec {
    /// Create a spec with defaults, mostly useful for building workflows in code
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            order: 0,
            depends_on: Vec::new(),
            parallelizable: false,
            parallel_group: None,
            resources: ResourceRequirements::default(),
            workload: Workload::default(),
            priority: Priority::default(),
            timeout_ms: None,
            retry_policy: None,
            component: None,
        }
    }

    /// Grouped steps are always parallelizable
    pub fn is_parallelizable(&self) -> bool {
        self.parallelizable || self.parallel_group.is_some()
    }

    /// Circuit breaker guarding this step
    pub fn breaker_key(&self) -> &str {
        self.component.as_deref().unwrap_or(&self.id)
    }

    /// Effective timeout for this step
    pub fn timeout(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(default_ms))
    }
}

/// A step that runs one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafStep {
    #[serde(flatten)]
    pub spec: StepSpec,

    /// Action name, matched by executors
    pub action: String,

    /// Action parameters
    #[serde(default)]
    pub params: serde_json::Value,
}

impl LeafStep {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            spec: StepSpec::new(id),
            action: action.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.spec.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.spec.parallel_group = Some(group.to_string());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn into_step(self) -> Step {
        Step::Leaf(self)
    }
}

/// A step that selects and runs one of its branches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalStep {
    #[serde(flatten)]
    pub spec: StepSpec,

    pub condition: Condition,

    pub branches: Vec<Branch>,
}

/// One arm of a conditional step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,

    /// The branch runs when the evaluated condition equals this value
    pub condition: bool,

    /// Steps run in order; any of them may be conditional
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Resources a step needs while it runs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default = "default_cpu")]
    pub cpu: f64,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

fn default_cpu() -> f64 {
    0.25
}
fn default_memory_mb() -> u64 {
    64
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_mb: default_memory_mb(),
        }
    }
}

/// Declared workload shape, used when ranking steps for worker slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    CpuBound,
    IoBound,
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// How a phase containing failed steps is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum FailurePolicy {
    /// Block direct dependents and stop the execution
    #[default]
    FailFast,

    /// Re-run exactly the failed subset up to `max_attempts` more times
    Retry { max_attempts: u32 },

    /// Block transitive dependents of failed steps and keep going
    Isolate,
}

/// Backoff curve between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Retry policy for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Growth factor for exponential backoff
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default)]
    pub backoff: BackoffKind,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff: BackoffKind::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            BackoffKind::Fixed => self.initial_delay_ms as f64,
            BackoffKind::Linear => self.initial_delay_ms as f64 * attempt as f64,
            BackoffKind::Exponential => {
                self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32)
            }
        };

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_WORKFLOW_YAML: &str = r#"
name: deploy
description: Build then fan out
variables:
  cpu: 91
failure_policy:
  policy: retry
  max_attempts: 2
steps:
  - id: init
    type: action
    action: echo
  - id: a
    type: action
    action: shell
    params:
      command: "echo a"
    depends_on: [init]
    parallel_group: fanout
  - id: b
    type: action
    action: echo
    depends_on: [init]
    parallel_group: fanout
    workload: cpu_bound
  - id: gate
    type: conditional
    depends_on: [a, b]
    condition:
      variable: cpu
      operator: gt
      value: 80
    branches:
      - id: hot
        condition: true
        steps:
          - id: throttle
            type: action
            action: echo
      - id: cold
        condition: false
"#;

    #[test]
    fn test_workflow_parsing() {
        let workflow = Workflow::from_yaml(TEST_WORKFLOW_YAML).unwrap();

        assert_eq!(workflow.name, "deploy");
        assert_eq!(workflow.steps.len(), 4);
        assert_eq!(workflow.failure_policy, Some(FailurePolicy::Retry { max_attempts: 2 }));
        assert!(workflow.get_step("gate").unwrap().is_conditional());

        let b = workflow.get_step("b").unwrap().spec();
        assert!(b.is_parallelizable());
        assert_eq!(b.workload, Workload::CpuBound);
        assert_eq!(b.resources, ResourceRequirements::default());
    }

    #[test]
    fn test_workflow_validation() {
        let workflow = Workflow::from_yaml(TEST_WORKFLOW_YAML).unwrap();
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let yaml = r#"
name: invalid
steps:
  - id: first
    type: action
    action: echo
    depends_on: [nonexistent]
"#;
        let workflow = Workflow::from_yaml(yaml).unwrap();
        assert!(matches!(workflow.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_duplicate_nested_id_rejected() {
        let yaml = r#"
name: dup
steps:
  - id: check
    type: conditional
    condition: { variable: x, operator: eq, value: 1 }
    branches:
      - id: matched
        condition: true
        steps:
          - id: check
            type: action
            action: echo
"#;
        let workflow = Workflow::from_yaml(yaml).unwrap();
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let workflow = Workflow {
            name: "cycle".to_string(),
            description: String::new(),
            variables: Default::default(),
            failure_policy: None,
            steps: vec![
                LeafStep::new("a", "echo").depends_on(&["b"]).into_step(),
                LeafStep::new("b", "echo").depends_on(&["a"]).into_step(),
            ],
        };
        assert!(matches!(workflow.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            initial_delay_ms: 100,
            backoff: BackoffKind::Linear,
            ..Default::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = RetryPolicy {
            initial_delay_ms: 100,
            backoff: BackoffKind::Fixed,
            ..Default::default()
        };
        assert_eq!(fixed.delay_for_attempt(4), Duration::from_millis(100));
    }
}
