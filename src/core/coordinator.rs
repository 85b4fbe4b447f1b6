//! Dependency phasing and parallel step execution.
//!
//! [`plan_phases`] splits a step graph into ordered phases. The
//! [`ExecutionCoordinator`] runs one phase at a time: every step of a phase
//! runs concurrently up to the granted worker count, failures are collected
//! after the whole batch finishes, and the configured [`FailurePolicy`]
//! decides what happens to dependents.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::StepExecutor;
use crate::domain::{EventPayload, ExecutionContext, StepResult, StepStatus};

use super::circuit_breaker::CircuitBreakerRegistry;
use super::condition::ConditionEvaluator;
use super::error::CoreError;
use super::event_bus::EventBus;
use super::workflow::{FailurePolicy, LeafStep, RetryPolicy, Step};

/// Steps that start together at one synchronization point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub index: usize,
    pub step_ids: Vec<String>,

    /// Whether the steps may run concurrently
    pub parallel: bool,
}

/// Partition top-level steps into dependency phases.
///
/// A step joins a phase once every step it depends on sits in an earlier
/// phase. Ready parallelizable steps share a phase; a parallel group is held
/// back until all of its members are ready; a non-parallelizable step gets a
/// phase of its own. Ties are broken by `order`, then id.
pub fn plan_phases(steps: &[Step]) -> Result<Vec<Phase>, CoreError> {
    let mut remaining: Vec<&Step> = steps.iter().collect();
    remaining.sort_by(|a, b| {
        a.spec()
            .order
            .cmp(&b.spec().order)
            .then_with(|| a.id().cmp(b.id()))
    });

    let mut placed: HashSet<&str> = HashSet::new();
    let mut phases: Vec<Phase> = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<&Step> = remaining
            .iter()
            .copied()
            .filter(|s| s.spec().depends_on.iter().all(|d| placed.contains(d.as_str())))
            .collect();

        // Group members wait for each other
        let mut pending_groups: HashSet<&str> = HashSet::new();
        for step in &remaining {
            if let Some(group) = step.spec().parallel_group.as_deref() {
                if !ready.iter().any(|r| r.id() == step.id()) {
                    pending_groups.insert(group);
                }
            }
        }
        let ready: Vec<&Step> = ready
            .into_iter()
            .filter(|s| {
                s.spec()
                    .parallel_group
                    .as_deref()
                    .map_or(true, |g| !pending_groups.contains(g))
            })
            .collect();

        let Some(first) = ready.first() else {
            let stuck: BTreeSet<&str> = remaining.iter().map(|s| s.id()).collect();
            return Err(CoreError::validation(format!(
                "Dependency cycle or unsatisfiable parallel group among steps: {}",
                stuck.into_iter().collect::<Vec<_>>().join(", ")
            )));
        };

        let batch: Vec<&Step> = if first.spec().is_parallelizable() {
            ready.iter().copied().filter(|s| s.spec().is_parallelizable()).collect()
        } else {
            vec![*first]
        };

        let step_ids: Vec<String> = batch.iter().map(|s| s.id().to_string()).collect();
        for step in &batch {
            placed.insert(step.id());
        }
        remaining.retain(|s| !placed.contains(s.id()));

        phases.push(Phase {
            index: phases.len(),
            parallel: first.spec().is_parallelizable(),
            step_ids,
        });
    }

    Ok(phases)
}

/// Live step statuses for one execution.
///
/// Waiters block on [`StatusBoard::wait_terminal`] until every step they
/// care about has finished.
#[derive(Clone)]
pub struct StatusBoard {
    sender: Arc<watch::Sender<HashMap<String, StepStatus>>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(HashMap::new());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn set(&self, step_id: &str, status: StepStatus) {
        self.sender.send_modify(|statuses| {
            statuses.insert(step_id.to_string(), status);
        });
    }

    pub fn status(&self, step_id: &str) -> StepStatus {
        self.sender
            .borrow()
            .get(step_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_terminal(&self, step_id: &str) -> bool {
        self.status(step_id).is_terminal()
    }

    /// Resolves once every id reports a terminal status
    pub async fn wait_terminal(&self, step_ids: &[String]) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = receiver
            .wait_for(|statuses| {
                step_ids
                    .iter()
                    .all(|id| statuses.get(id).is_some_and(StepStatus::is_terminal))
            })
            .await;
    }
}

/// What one phase runs against
pub struct PhaseScope<'a> {
    pub phase: usize,

    /// Every top-level step of the workflow, for dependent lookups
    pub all_steps: &'a [Step],

    pub context: &'a ExecutionContext,
    pub workers: usize,
    pub board: &'a StatusBoard,
}

/// Results of one concurrent batch
#[derive(Debug, Clone)]
pub struct ParallelOutcome {
    pub results: BTreeMap<String, StepResult>,

    /// Longest individual step time
    pub execution_time: Duration,
}

impl ParallelOutcome {
    pub fn failed_ids(&self) -> Vec<String> {
        self.results
            .values()
            .filter(|r| !r.success)
            .map(|r| r.step_id.clone())
            .collect()
    }
}

/// How a phase with failed steps was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureResolution {
    /// Retries made every failed step succeed
    Recovered,

    /// Stop the execution; listed steps were marked blocked
    Stop { blocked: Vec<String> },

    /// Keep going without the listed (blocked) steps
    Continue { blocked: Vec<String> },
}

/// Runs steps and phases
pub struct ExecutionCoordinator {
    executors: Vec<Arc<dyn StepExecutor>>,
    pub(crate) evaluator: ConditionEvaluator,
    breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) events: EventBus,
    step_timeout_ms: u64,

    /// Applied to leaf steps that declare no retry policy
    default_retry: RetryPolicy,
}

impl ExecutionCoordinator {
    pub fn new(
        executors: Vec<Arc<dyn StepExecutor>>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: EventBus,
        step_timeout_ms: u64,
    ) -> Self {
        Self {
            executors,
            evaluator: ConditionEvaluator::new(),
            breakers,
            events,
            step_timeout_ms,
            default_retry: RetryPolicy::none(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// See [`plan_phases`]
    pub fn manage_step_dependencies(&self, steps: &[Step]) -> Result<Vec<Phase>, CoreError> {
        plan_phases(steps)
    }

    /// Run a batch concurrently, bounded by `scope.workers`.
    ///
    /// One step's failure never aborts its siblings; every step gets a result.
    pub async fn coordinate_parallel_execution(
        &self,
        scope: &PhaseScope<'_>,
        batch: &[&Step],
    ) -> ParallelOutcome {
        let execution_id = scope.context.execution_id;
        let workers = scope.workers.max(1);
        let started = Instant::now();

        self.events.publish(EventPayload::ParallelExecutionStarted {
            execution_id,
            phase: scope.phase,
            step_ids: batch.iter().map(|s| s.id().to_string()).collect(),
            workers,
        });

        let semaphore = Semaphore::new(workers);
        let semaphore = &semaphore;
        let runs = batch.iter().map(|step| async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return StepResult::not_run(step.id(), StepStatus::Skipped, "worker pool closed");
            };
            scope.board.set(step.id(), StepStatus::Running);
            let result = self.run_step(step, scope.context, 0).await;
            scope.board.set(step.id(), result.status);
            result
        });
        let results = join_all(runs).await;

        let execution_time = results
            .iter()
            .map(|r| r.execution_time)
            .max()
            .unwrap_or_default();
        let failed = results.iter().filter(|r| !r.success).count();

        self.events.publish(EventPayload::ParallelExecutionCompleted {
            execution_id,
            phase: scope.phase,
            succeeded: results.len() - failed,
            failed,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        ParallelOutcome {
            results: results.into_iter().map(|r| (r.step_id.clone(), r)).collect(),
            execution_time,
        }
    }

    /// Barrier: wait until every listed step is terminal
    pub async fn synchronize_steps(
        &self,
        board: &StatusBoard,
        step_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        tokio::select! {
            _ = board.wait_terminal(step_ids) => Ok(()),
            _ = cancel.cancelled() => Err(CoreError::Cancelled("waiting at synchronization barrier".to_string())),
        }
    }

    /// Apply the failure policy to a phase's failed steps.
    ///
    /// Retry results replace the originals in `results`. Steps blocked by
    /// the policy are marked on the board and get a `Blocked` result.
    pub async fn handle_parallel_failures(
        &self,
        scope: &PhaseScope<'_>,
        policy: FailurePolicy,
        mut failed: Vec<String>,
        results: &mut BTreeMap<String, StepResult>,
    ) -> FailureResolution {
        if let FailurePolicy::Retry { max_attempts } = policy {
            let mut attempt = 0;
            while !failed.is_empty() && attempt < max_attempts {
                attempt += 1;
                self.events.publish(EventPayload::ParallelRetryAttempt {
                    execution_id: scope.context.execution_id,
                    attempt,
                    step_ids: failed.clone(),
                });
                info!(phase = scope.phase, attempt, steps = ?failed, "Retrying failed steps");

                let batch: Vec<&Step> = scope
                    .all_steps
                    .iter()
                    .filter(|s| failed.iter().any(|id| id == s.id()))
                    .collect();
                let retried = self.coordinate_parallel_execution(scope, &batch).await;

                for (id, mut result) in retried.results {
                    if let Some(previous) = results.get(&id) {
                        result.attempts += previous.attempts;
                    }
                    results.insert(id, result);
                }
                failed.retain(|id| results.get(id).is_some_and(|r| !r.success));
            }

            if failed.is_empty() {
                return FailureResolution::Recovered;
            }
        }

        match policy {
            FailurePolicy::Isolate => {
                let blocked = transitive_dependents(scope.all_steps, &failed);
                self.block(scope, &blocked, &failed);
                FailureResolution::Continue { blocked }
            }
            FailurePolicy::FailFast | FailurePolicy::Retry { .. } => {
                let blocked = direct_dependents(scope.all_steps, &failed);
                self.block(scope, &blocked, &failed);
                FailureResolution::Stop { blocked }
            }
        }
    }

    fn block(&self, scope: &PhaseScope<'_>, blocked: &[String], failed: &[String]) {
        for id in blocked {
            warn!(step = %id, failed = ?failed, "Step blocked by failed dependency");
            scope.board.set(id, StepStatus::Blocked);
        }
    }

    /// Run any step; conditional steps recurse into their selected branch
    pub fn run_step<'a>(
        &'a self,
        step: &'a Step,
        context: &'a ExecutionContext,
        depth: u32,
    ) -> BoxFuture<'a, StepResult> {
        async move {
            let execution_id = context.execution_id;
            self.events.publish(EventPayload::StepStarted {
                execution_id,
                step_id: step.id().to_string(),
            });
            debug!(step = %step.id(), depth, "Step started");

            let result = match step {
                Step::Leaf(leaf) => self.run_leaf(leaf, context).await,
                Step::Conditional(conditional) => {
                    self.run_conditional(conditional, context, depth).await
                }
            };

            if result.success {
                debug!(step = %step.id(), elapsed_ms = result.execution_time.as_millis() as u64, "Step completed");
            } else {
                warn!(step = %step.id(), error = ?result.error, "Step failed");
            }
            self.events.publish(EventPayload::StepFinished {
                execution_id,
                step_id: step.id().to_string(),
                status: result.status,
                duration_ms: result.execution_time.as_millis() as u64,
                error: result.error.clone(),
            });
            result
        }
        .boxed()
    }

    /// Leaf step: executor lookup, circuit breaker, timeout, per-step retry
    async fn run_leaf(&self, leaf: &LeafStep, context: &ExecutionContext) -> StepResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let step_id = leaf.spec.id.as_str();

        let Some(executor) = self.executors.iter().find(|e| e.can_execute(leaf)) else {
            let err = CoreError::UnknownOperation {
                step: step_id.to_string(),
                action: leaf.action.clone(),
            };
            return StepResult::failed(step_id, err.to_string(), started_at, started.elapsed());
        };

        let breaker = self.breakers.get(leaf.spec.breaker_key());
        let policy = leaf
            .spec
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        let timeout = leaf.spec.timeout(self.step_timeout_ms);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            let outcome = breaker
                .execute(|| async {
                    match tokio::time::timeout(timeout, executor.execute(leaf, context, timeout)).await {
                        Ok(result) => result,
                        Err(_) => Err(CoreError::TimeoutExceeded {
                            what: format!("step '{}'", step_id),
                            elapsed_ms: attempt_started.elapsed().as_millis() as u64,
                        }
                        .into()),
                    }
                })
                .await;

            match outcome {
                Ok(output) => {
                    return StepResult::succeeded(step_id, output, started_at, started.elapsed())
                        .with_attempts(attempt);
                }
                Err(e) => {
                    if CoreError::classify(&e).is_retryable() && policy.should_retry(attempt) {
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            step = %step_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return StepResult::failed(step_id, format!("{:#}", e), started_at, started.elapsed())
                        .with_attempts(attempt);
                }
            }
        }
    }
}

/// Steps that list any of `failed` in `depends_on`
pub fn direct_dependents(steps: &[Step], failed: &[String]) -> Vec<String> {
    steps
        .iter()
        .filter(|s| s.spec().depends_on.iter().any(|d| failed.contains(d)))
        .map(|s| s.id().to_string())
        .collect()
}

/// Steps reachable from `failed` through `depends_on`, excluding `failed`
pub fn transitive_dependents(steps: &[Step], failed: &[String]) -> Vec<String> {
    let mut blocked: Vec<String> = Vec::new();
    let mut frontier: Vec<String> = failed.to_vec();

    while !frontier.is_empty() {
        let next: Vec<String> = direct_dependents(steps, &frontier)
            .into_iter()
            .filter(|id| !blocked.contains(id) && !failed.contains(id))
            .collect();
        blocked.extend(next.iter().cloned());
        frontier = next;
    }

    blocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreakerConfig;
    use crate::core::event_bus::MemorySink;
    use crate::domain::CircuitState;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// `sleep` waits `params.ms`; `fail` always errors; `flaky` fails
    /// `params.failures` times then succeeds
    #[derive(Default)]
    struct TestExecutor {
        calls: AtomicU32,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl StepExecutor for TestExecutor {
        fn name(&self) -> &str {
            "test"
        }

        fn can_execute(&self, step: &LeafStep) -> bool {
            matches!(step.action.as_str(), "sleep" | "fail" | "flaky")
        }

        async fn execute(&self, step: &LeafStep, _: &ExecutionContext, _: Duration) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let ms = step.params.get("ms").and_then(Value::as_u64).unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            match step.action.as_str() {
                "fail" => anyhow::bail!("step {} broke", step.spec.id),
                "flaky" => {
                    let failures = step.params.get("failures").and_then(Value::as_u64).unwrap_or(1);
                    if (call as u64) < failures {
                        anyhow::bail!("flaky failure {}", call)
                    }
                    Ok(json!("recovered"))
                }
                _ => Ok(json!({ "step": step.spec.id })),
            }
        }
    }

    fn coordinator(executor: Arc<TestExecutor>, events: EventBus) -> ExecutionCoordinator {
        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            ..Default::default()
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(config, events.clone()).unwrap());
        ExecutionCoordinator::new(vec![executor], breakers, events, 1_000)
    }

    fn parallel(id: &str, action: &str, deps: &[&str]) -> Step {
        let mut step = LeafStep::new(id, action).depends_on(deps);
        step.spec.parallelizable = true;
        step.into_step()
    }

    fn ids(phase: &Phase) -> Vec<&str> {
        phase.step_ids.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_plan_fan_out_fan_in() {
        let steps = vec![
            LeafStep::new("init", "sleep").into_step(),
            parallel("c", "sleep", &["init"]),
            parallel("a", "sleep", &["init"]),
            parallel("b", "sleep", &["init"]),
            LeafStep::new("finalize", "sleep")
                .depends_on(&["a", "b", "c"])
                .into_step(),
        ];

        let phases = plan_phases(&steps).unwrap();
        assert_eq!(phases.len(), 3);
        assert_eq!(ids(&phases[0]), vec!["init"]);
        assert_eq!(ids(&phases[1]), vec!["a", "b", "c"]);
        assert!(phases[1].parallel);
        assert_eq!(ids(&phases[2]), vec!["finalize"]);
    }

    #[test]
    fn test_plan_non_parallel_steps_run_alone() {
        let steps = vec![
            LeafStep::new("x", "sleep").into_step(),
            LeafStep::new("y", "sleep").into_step(),
        ];
        let phases = plan_phases(&steps).unwrap();
        assert_eq!(phases.len(), 2);
        assert!(!phases[0].parallel);
    }

    #[test]
    fn test_plan_holds_group_until_all_members_ready() {
        let steps = vec![
            LeafStep::new("a", "sleep").into_step(),
            LeafStep::new("slow", "sleep").depends_on(&["a"]).into_step(),
            LeafStep::new("g1", "sleep").depends_on(&["a"]).in_group("g").into_step(),
            LeafStep::new("g2", "sleep").depends_on(&["slow"]).in_group("g").into_step(),
        ];

        let phases = plan_phases(&steps).unwrap();
        let all: Vec<Vec<&str>> = phases.iter().map(ids).collect();
        assert_eq!(all, vec![vec!["a"], vec!["slow"], vec!["g1", "g2"]]);
    }

    #[test]
    fn test_plan_rejects_group_member_dependency() {
        let steps = vec![
            LeafStep::new("g1", "sleep").in_group("g").into_step(),
            LeafStep::new("g2", "sleep").depends_on(&["g1"]).in_group("g").into_step(),
        ];
        assert!(matches!(plan_phases(&steps), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_dependents() {
        let steps = vec![
            LeafStep::new("a", "sleep").into_step(),
            LeafStep::new("b", "sleep").depends_on(&["a"]).into_step(),
            LeafStep::new("c", "sleep").depends_on(&["b"]).into_step(),
            LeafStep::new("d", "sleep").into_step(),
        ];
        let failed = vec!["a".to_string()];
        assert_eq!(direct_dependents(&steps, &failed), vec!["b"]);
        assert_eq!(transitive_dependents(&steps, &failed), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_status_board_barrier() {
        let board = StatusBoard::new();
        let ids = vec!["a".to_string(), "b".to_string()];
        board.set("a", StepStatus::Completed);
        board.set("b", StepStatus::Running);

        let waiter = {
            let board = board.clone();
            let ids = ids.clone();
            tokio::spawn(async move { board.wait_terminal(&ids).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        board.set("b", StepStatus::Failed);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_parallel_respects_workers_and_collects_failures() {
        let executor = Arc::new(TestExecutor::default());
        let events = EventBus::new();
        let sink = MemorySink::new();
        events.add_sink(sink.clone());
        let coordinator = coordinator(Arc::clone(&executor), events);

        let steps = vec![
            parallel("a", "sleep", &[]),
            parallel("b", "fail", &[]),
            parallel("c", "sleep", &[]),
        ];
        let batch: Vec<&Step> = steps.iter().collect();
        let context = ExecutionContext::new("wf");
        let board = StatusBoard::new();
        let scope = PhaseScope {
            phase: 0,
            all_steps: &steps,
            context: &context,
            workers: 2,
            board: &board,
        };

        let outcome = coordinator.coordinate_parallel_execution(&scope, &batch).await;

        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.failed_ids(), vec!["b"]);
        assert!(outcome.results["a"].success);
        assert!(outcome.results["c"].success);
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        assert!(board.is_terminal("b"));
        assert_eq!(sink.count("parallel.started"), 1);
        assert_eq!(sink.count("parallel.completed"), 1);
        assert_eq!(sink.count("step.finished"), 3);

        let longest = outcome.results.values().map(|r| r.execution_time).max().unwrap();
        assert_eq!(outcome.execution_time, longest);
    }

    #[tokio::test]
    async fn test_retry_policy_reruns_only_failed_subset() {
        let executor = Arc::new(TestExecutor::default());
        let events = EventBus::new();
        let sink = MemorySink::new();
        events.add_sink(sink.clone());
        let coordinator = coordinator(Arc::clone(&executor), events);

        let mut flaky = LeafStep::new("flaky", "flaky").with_params(json!({ "failures": 1 }));
        flaky.spec.parallelizable = true;
        let steps = vec![flaky.into_step()];
        let batch: Vec<&Step> = steps.iter().collect();
        let context = ExecutionContext::new("wf");
        let board = StatusBoard::new();
        let scope = PhaseScope {
            phase: 0,
            all_steps: &steps,
            context: &context,
            workers: 1,
            board: &board,
        };

        let outcome = coordinator.coordinate_parallel_execution(&scope, &batch).await;
        let mut results = outcome.results.clone();
        let resolution = coordinator
            .handle_parallel_failures(
                &scope,
                FailurePolicy::Retry { max_attempts: 2 },
                outcome.failed_ids(),
                &mut results,
            )
            .await;

        assert_eq!(resolution, FailureResolution::Recovered);
        assert!(results["flaky"].success);
        assert_eq!(results["flaky"].attempts, 2);
        assert_eq!(sink.count("parallel.retry_attempt"), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_blocks_direct_dependents() {
        let executor = Arc::new(TestExecutor::default());
        let coordinator = coordinator(executor, EventBus::new());

        let steps = vec![
            LeafStep::new("a", "fail").into_step(),
            LeafStep::new("b", "sleep").depends_on(&["a"]).into_step(),
            LeafStep::new("c", "sleep").depends_on(&["b"]).into_step(),
        ];
        let context = ExecutionContext::new("wf");
        let board = StatusBoard::new();
        let scope = PhaseScope {
            phase: 0,
            all_steps: &steps,
            context: &context,
            workers: 1,
            board: &board,
        };

        let mut results = BTreeMap::new();
        let resolution = coordinator
            .handle_parallel_failures(&scope, FailurePolicy::FailFast, vec!["a".to_string()], &mut results)
            .await;

        assert_eq!(
            resolution,
            FailureResolution::Stop {
                blocked: vec!["b".to_string()]
            }
        );
        assert_eq!(board.status("b"), StepStatus::Blocked);
        assert_eq!(board.status("c"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_action_fails_step() {
        let coordinator = coordinator(Arc::new(TestExecutor::default()), EventBus::new());
        let step = LeafStep::new("deploy", "teleport").into_step();

        let result = coordinator.run_step(&step, &ExecutionContext::new("wf"), 0).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Unknown operation 'teleport'"));
    }

    #[tokio::test]
    async fn test_step_timeout_marks_failed() {
        let coordinator = coordinator(Arc::new(TestExecutor::default()), EventBus::new());
        let mut leaf = LeafStep::new("slow", "sleep").with_params(json!({ "ms": 500 }));
        leaf.spec.timeout_ms = Some(20);
        let step = leaf.into_step();

        let result = coordinator.run_step(&step, &ExecutionContext::new("wf"), 0).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("Timeout exceeded"));
        assert!(result.execution_time < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_breakers_are_per_step_unless_component_shared() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let events = EventBus::new();
        let breakers = Arc::new(CircuitBreakerRegistry::new(config, events.clone()).unwrap());
        let executor = Arc::new(TestExecutor::default());
        let coordinator =
            ExecutionCoordinator::new(vec![executor.clone()], Arc::clone(&breakers), events, 1_000);
        let context = ExecutionContext::new("wf");

        let broken = LeafStep::new("broken", "fail").with_params(json!({ "ms": 1 }));
        assert!(!coordinator.run_step(&broken.into_step(), &context, 0).await.success);

        // Same executor, different step: its own closed breaker
        let healthy = LeafStep::new("healthy", "sleep").with_params(json!({ "ms": 1 }));
        assert!(coordinator.run_step(&healthy.into_step(), &context, 0).await.success);
        assert_eq!(breakers.get("broken").state(), CircuitState::Open);
        assert_eq!(breakers.get("healthy").state(), CircuitState::Closed);

        let mut first = LeafStep::new("first", "fail").with_params(json!({ "ms": 1 }));
        first.spec.component = Some("db".to_string());
        let mut second = LeafStep::new("second", "sleep").with_params(json!({ "ms": 1 }));
        second.spec.component = Some("db".to_string());

        assert!(!coordinator.run_step(&first.into_step(), &context, 0).await.success);
        let rejected = coordinator.run_step(&second.into_step(), &context, 0).await;
        assert!(!rejected.success);
        assert!(rejected.error.unwrap().contains("db"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_per_step_retry_policy() {
        let executor = Arc::new(TestExecutor::default());
        let coordinator = coordinator(Arc::clone(&executor), EventBus::new());
        let mut leaf = LeafStep::new("flaky", "flaky").with_params(json!({ "failures": 2, "ms": 1 }));
        leaf.spec.retry_policy = Some(RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            ..Default::default()
        });
        let step = leaf.into_step();

        let result = coordinator.run_step(&step, &ExecutionContext::new("wf"), 0).await;
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }
}
