//! Error taxonomy for the orchestration core.

use thiserror::Error;

/// Typed failures raised by core components.
///
/// These travel inside `anyhow::Error` across adapter boundaries; recover the
/// category with `err.downcast_ref::<CoreError>()`.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed condition, workflow or configuration
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown recovery strategy: {0}")]
    UnknownStrategy(String),

    /// No executor accepts the step's action
    #[error("Unknown operation '{action}' for step '{step}'")]
    UnknownOperation { step: String, action: String },

    #[error("Transient execution failure: {0}")]
    TransientExecutionFailure(String),

    #[error("Timeout exceeded after {elapsed_ms}ms: {what}")]
    TimeoutExceeded { what: String, elapsed_ms: u64 },

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The circuit breaker rejected the call without running it
    #[error("Circuit breaker for '{component}' is open")]
    CircuitOpen { component: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientExecutionFailure(_) | Self::TimeoutExceeded { .. }
        )
    }

    /// Classify an arbitrary error: typed core errors keep their category,
    /// anything else is treated as a transient execution failure
    pub fn classify(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<CoreError>() {
            Some(core) => core.clone(),
            None => Self::TransientExecutionFailure(format!("{:#}", err)),
        }
    }
}
