//! Built-in step executor used by the CLI.
//!
//! `shell` runs `params.command` through `sh -c`; `echo` hands back its
//! params unchanged.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::workflow::LeafStep;
use crate::domain::ExecutionContext;

use super::StepExecutor;

const SHELL: &str = "shell";
const ECHO: &str = "echo";

/// Shell/echo executor
pub struct CommandExecutor {
    shell_path: String,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    /// Use a different shell binary
    pub fn with_shell(shell_path: impl Into<String>) -> Self {
        Self {
            shell_path: shell_path.into(),
        }
    }

    async fn run_shell(
        &self,
        step: &LeafStep,
        context: &ExecutionContext,
        step_timeout: Duration,
    ) -> Result<Value> {
        let command = step
            .params
            .get("command")
            .and_then(Value::as_str)
            .with_context(|| format!("Step '{}' has no params.command", step.spec.id))?;

        let mut child = Command::new(&self.shell_path)
            .args(["-c", command])
            .env("MENDER_WORKFLOW", &context.workflow_id)
            .env("MENDER_EXECUTION_ID", context.execution_id.to_string())
            .env("MENDER_STEP", &step.spec.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn shell for step '{}'", step.spec.id))?;

        // Variables go in on stdin as JSON
        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(&context.variables)
                .context("Failed to serialize context variables")?;
            // A command that ignores stdin may close it early
            let _ = stdin.write_all(&input).await;
        }

        let output = timeout(step_timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "Step '{}' timed out after {:?}",
                    step.spec.id, step_timeout
                )
            })?
            .with_context(|| format!("Failed to wait for step '{}'", step.spec.id))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Command for step '{}' failed with exit code {}: {}",
                step.spec.id,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("Command output is not valid UTF-8")?;

        // Structured output is passed through as-is
        Ok(serde_json::from_str(stdout.trim()).unwrap_or_else(|_| {
            json!({ "stdout": stdout.trim_end() })
        }))
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    fn can_execute(&self, step: &LeafStep) -> bool {
        matches!(step.action.as_str(), SHELL | ECHO)
    }

    async fn execute(
        &self,
        step: &LeafStep,
        context: &ExecutionContext,
        timeout: Duration,
    ) -> Result<Value> {
        match step.action.as_str() {
            SHELL => self.run_shell(step, context, timeout).await,
            ECHO => Ok(step.params.clone()),
            other => anyhow::bail!("Unsupported action '{}'", other),
        }
    }
}
