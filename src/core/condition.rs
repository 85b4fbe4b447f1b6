//! Boolean conditions over an execution context.
//!
//! Conditions are plain data so they can live in workflow YAML:
//!
//! ```yaml
//! condition:
//!   all:
//!     - { variable: metrics.cpu, operator: gt, value: 80 }
//!     - { variable: env, operator: eq, value: prod }
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ExecutionContext;

use super::error::CoreError;

/// A simple comparison or a composite of sub-conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// True when every sub-condition is true
    All { all: Vec<Condition> },

    /// True when at least one sub-condition is true
    Any { any: Vec<Condition> },

    /// Compare a context value (dotted path) against a literal
    Compare {
        variable: String,
        operator: Operator,
        value: Value,
    },
}

impl Condition {
    pub fn compare(variable: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self::Compare {
            variable: variable.into(),
            operator,
            value,
        }
    }

    pub fn is_composite(&self) -> bool {
        !matches!(self, Self::Compare { .. })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare {
                variable,
                operator,
                value,
            } => write!(f, "{} {} {}", variable, operator, value),
            Self::All { all } => write_joined(f, all, "AND"),
            Self::Any { any } => write_joined(f, any, "OR"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Condition], joiner: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", joiner)?;
        }
        write!(f, "{}", part)?;
    }
    write!(f, ")")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    /// Substring, array membership, or object key
    Contains,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Contains => "contains",
        }
    }

    fn is_ordering(&self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One problem found while validating a condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub variable: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.variable, self.message)
    }
}

/// Result of evaluating a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub result: bool,

    /// Human-readable form of the evaluated condition
    pub expression: String,

    /// Context value that was compared (simple conditions only)
    pub evaluated_value: Option<Value>,

    pub operator: Option<Operator>,

    /// One entry per sub-expression of a composite condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_results: Vec<Evaluation>,
}

/// Evaluates [`Condition`]s against an [`ExecutionContext`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Check every referenced variable exists and every comparison is well-formed.
    ///
    /// Returns all issues found, not just the first.
    pub fn validate_condition(
        &self,
        condition: &Condition,
        context: &ExecutionContext,
    ) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        collect_issues(condition, context, &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Evaluate a condition of any shape
    pub fn evaluate(
        &self,
        condition: &Condition,
        context: &ExecutionContext,
    ) -> Result<Evaluation, CoreError> {
        match condition {
            Condition::Compare {
                variable,
                operator,
                value,
            } => self.evaluate_simple(variable, *operator, value, context),
            Condition::All { .. } | Condition::Any { .. } => {
                self.evaluate_complex(condition, context)
            }
        }
    }

    /// Evaluate a composite condition.
    ///
    /// Every sub-expression is evaluated so the report carries each
    /// sub-result, even when the outcome is already decided.
    pub fn evaluate_complex(
        &self,
        condition: &Condition,
        context: &ExecutionContext,
    ) -> Result<Evaluation, CoreError> {
        let (parts, require_all) = match condition {
            Condition::All { all } => (all, true),
            Condition::Any { any } => (any, false),
            Condition::Compare { .. } => return self.evaluate(condition, context),
        };

        if parts.is_empty() {
            return Err(CoreError::validation(format!(
                "Composite condition has no sub-expressions: {}",
                condition
            )));
        }

        let sub_results = parts
            .iter()
            .map(|part| self.evaluate(part, context))
            .collect::<Result<Vec<_>, _>>()?;

        let result = if require_all {
            sub_results.iter().all(|r| r.result)
        } else {
            sub_results.iter().any(|r| r.result)
        };

        Ok(Evaluation {
            result,
            expression: condition.to_string(),
            evaluated_value: None,
            operator: None,
            sub_results,
        })
    }

    fn evaluate_simple(
        &self,
        variable: &str,
        operator: Operator,
        expected: &Value,
        context: &ExecutionContext,
    ) -> Result<Evaluation, CoreError> {
        let actual = context.lookup(variable).ok_or_else(|| {
            CoreError::validation(format!("Variable '{}' not found in context", variable))
        })?;

        let result = match operator {
            Operator::Eq => values_equal(actual, expected),
            Operator::Ne => !values_equal(actual, expected),
            Operator::Contains => contains(actual, expected),
            ordering => {
                let ord = compare_values(actual, expected).ok_or_else(|| {
                    CoreError::validation(format!(
                        "Cannot compare {} with {} using '{}'",
                        actual, expected, ordering
                    ))
                })?;
                match ordering {
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Gte => ord != Ordering::Less,
                    Operator::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                }
            }
        };

        Ok(Evaluation {
            result,
            expression: format!("{} {} {}", variable, operator, expected),
            evaluated_value: Some(actual.clone()),
            operator: Some(operator),
            sub_results: Vec::new(),
        })
    }
}

fn collect_issues(condition: &Condition, context: &ExecutionContext, issues: &mut Vec<ValidationIssue>) {
    match condition {
        Condition::Compare {
            variable,
            operator,
            value,
        } => {
            let Some(actual) = context.lookup(variable) else {
                issues.push(ValidationIssue {
                    variable: variable.clone(),
                    message: "variable not found in context".to_string(),
                });
                return;
            };
            if operator.is_ordering() && compare_values(actual, value).is_none() {
                issues.push(ValidationIssue {
                    variable: variable.clone(),
                    message: format!("cannot order {} against {}", actual, value),
                });
            }
        }
        Condition::All { all: parts } | Condition::Any { any: parts } => {
            if parts.is_empty() {
                issues.push(ValidationIssue {
                    variable: String::new(),
                    message: "composite condition has no sub-expressions".to_string(),
                });
            }
            for part in parts {
                collect_issues(part, context, issues);
            }
        }
    }
}

/// Numbers compare numerically regardless of integer/float representation
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), _) => items.iter().any(|item| values_equal(item, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}
