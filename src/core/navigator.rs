//! Conditional steps and branch navigation.
//!
//! A conditional step validates its condition, evaluates it, picks the
//! branch whose declared boolean matches, and runs that branch's steps in
//! order against a private copy of the context. A conditional step inside a
//! branch recurses one level deeper.

use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, info};

use crate::domain::{BranchResult, EventPayload, ExecutionContext, StepResult, StepStatus};

use super::condition::Evaluation;
use super::coordinator::ExecutionCoordinator;
use super::error::CoreError;
use super::workflow::{Branch, ConditionalStep};

/// Pick the branch whose declared condition equals the evaluated result.
///
/// No match is a validation error on the conditional step.
pub fn select_branch<'a>(
    evaluation: &Evaluation,
    branches: &'a [Branch],
) -> Result<&'a Branch, CoreError> {
    branches
        .iter()
        .find(|b| b.condition == evaluation.result)
        .ok_or_else(|| {
            CoreError::validation(format!(
                "No branch declared for condition '{}' evaluating to {}",
                evaluation.expression, evaluation.result
            ))
        })
}

impl ExecutionCoordinator {
    /// Run a branch's steps in order.
    ///
    /// The first failure skips the rest of the branch. Outputs of earlier
    /// branch steps are visible to later ones through `context`.
    pub fn navigate_branch<'a>(
        &'a self,
        step_id: &'a str,
        branch: &'a Branch,
        mut context: ExecutionContext,
        depth: u32,
    ) -> BoxFuture<'a, BranchResult> {
        async move {
            self.events.publish(EventPayload::BranchSelected {
                step_id: step_id.to_string(),
                branch_id: branch.id.clone(),
                depth,
            });
            info!(step = %step_id, branch = %branch.id, depth, "Navigating branch");

            let mut step_results = Vec::with_capacity(branch.steps.len());
            let mut nested_results = Vec::new();
            let mut success = true;

            for step in &branch.steps {
                if !success {
                    step_results.push(StepResult::not_run(
                        step.id(),
                        StepStatus::Skipped,
                        format!("earlier step in branch '{}' failed", branch.id),
                    ));
                    continue;
                }

                let result = self.run_step(step, &context, depth).await;
                if let Some(nested) = &result.branch {
                    nested_results.push(nested.clone());
                }
                context.absorb(&result);
                success = result.success;
                step_results.push(result);
            }

            BranchResult {
                branch_id: branch.id.clone(),
                depth,
                success,
                step_results,
                nested_results,
            }
        }
        .boxed()
    }

    /// Validate, evaluate, select, navigate
    pub(crate) async fn run_conditional(
        &self,
        step: &ConditionalStep,
        context: &ExecutionContext,
        depth: u32,
    ) -> StepResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let step_id = step.spec.id.as_str();

        if let Err(issues) = self.evaluator.validate_condition(&step.condition, context) {
            let detail: Vec<String> = issues.iter().map(ToString::to_string).collect();
            let err = CoreError::validation(format!(
                "condition of step '{}': {}",
                step_id,
                detail.join("; ")
            ));
            return StepResult::failed(step_id, err.to_string(), started_at, started.elapsed());
        }

        let evaluation = match self.evaluator.evaluate(&step.condition, context) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                return StepResult::failed(step_id, e.to_string(), started_at, started.elapsed())
            }
        };

        self.events.publish(EventPayload::ConditionEvaluated {
            step_id: step_id.to_string(),
            expression: evaluation.expression.clone(),
            result: evaluation.result,
        });
        debug!(step = %step_id, expression = %evaluation.expression, result = evaluation.result, "Condition evaluated");

        let branch = match select_branch(&evaluation, &step.branches) {
            Ok(branch) => branch,
            Err(e) => {
                return StepResult::failed(step_id, e.to_string(), started_at, started.elapsed())
            }
        };

        let branch_result = self
            .navigate_branch(step_id, branch, context.clone(), depth + 1)
            .await;

        let output = json!({
            "branch": branch.id,
            "evaluation": evaluation,
        });
        let mut result = if branch_result.success {
            StepResult::succeeded(step_id, output, started_at, started.elapsed())
        } else {
            StepResult::failed(
                step_id,
                format!("branch '{}' failed", branch.id),
                started_at,
                started.elapsed(),
            )
        };
        result.branch = Some(branch_result);
        result
    }
}
