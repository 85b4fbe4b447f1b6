//! Command-line interface for mender.
//!
//! Provides commands for running workflows, inspecting their dependency
//! phases, validating definitions, replaying event logs, and showing the
//! resolved configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{CommandExecutor, StepExecutor};
use crate::config::{load_config, ResolvedConfig};
use crate::core::{
    CircuitBreakerRegistry, EventBus, EventLog, ResourceManager, Workflow, WorkflowEngine,
};
use crate::domain::{ExecutionContext, ExecutionReport, ExecutionStatus, StepStatus};

/// mender - workflow execution and self-healing core
#[derive(Parser, Debug)]
#[command(name = "mender")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .mender/config.yaml discovery)
    #[arg(long, global = true, env = "MENDER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a workflow
    Run {
        /// Workflow definition (YAML)
        workflow: PathBuf,

        /// Set a context variable (repeatable); values are parsed as JSON
        /// when possible, otherwise taken as strings
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Append every published event to this JSONL file
        #[arg(long)]
        events: Option<PathBuf>,
    },

    /// Show the dependency phases of a workflow
    Plan {
        workflow: PathBuf,
    },

    /// Validate a workflow definition
    Validate {
        workflow: PathBuf,
    },

    /// Replay an event log
    Events {
        /// Event log file (JSONL)
        file: PathBuf,

        /// Only show events with this name (e.g. step.finished)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                workflow,
                vars,
                events,
            } => {
                let resolved = load_config(self.config.as_deref())?;
                run_workflow(&resolved, &workflow, &vars, events).await
            }
            Commands::Plan { workflow } => {
                let resolved = load_config(self.config.as_deref())?;
                show_plan(&resolved, &workflow)
            }
            Commands::Validate { workflow } => validate_workflow(&workflow),
            Commands::Events { file, name } => show_events(&file, name.as_deref()).await,
            Commands::Config => {
                let resolved = load_config(self.config.as_deref())?;
                show_config(&resolved)
            }
        }
    }
}

/// Parse `key=value`; the value is JSON if it parses, else a string
fn parse_var(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Invalid --var '{}', expected KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Invalid --var '{}': empty key", raw);
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_engine(resolved: &ResolvedConfig, events: &EventBus) -> Result<WorkflowEngine> {
    let config = &resolved.config;
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        config.circuit_breaker.clone(),
        events.clone(),
    )?);
    let resources = ResourceManager::new(config.resources, events.clone());
    let executors: Vec<Arc<dyn StepExecutor>> = vec![Arc::new(CommandExecutor::new())];

    Ok(WorkflowEngine::new(
        executors,
        breakers,
        resources,
        events.clone(),
        config.engine.clone(),
    )
    .with_retry_policy(config.retry.clone()))
}

/// Run a workflow end to end
async fn run_workflow(
    resolved: &ResolvedConfig,
    path: &Path,
    vars: &[String],
    events_file: Option<PathBuf>,
) -> Result<()> {
    let workflow = Workflow::from_file(path)?;

    let mut context = ExecutionContext::new(&workflow.name);
    for raw in vars {
        let (key, value) = parse_var(raw)?;
        context.set_variable(key, value);
    }
    let execution_id = context.execution_id;

    let events = EventBus::new();
    let stop_recording = CancellationToken::new();
    let recorder = match events_file {
        Some(file) => {
            let log = EventLog::open(file).await?;
            info!(path = %log.path().display(), "Recording events");
            Some(log.record(events.subscribe(), stop_recording.clone()))
        }
        None => None,
    };

    let engine = Arc::new(build_engine(resolved, &events)?);

    // Ctrl-C cancels the execution instead of killing the process
    let interrupt = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling execution");
                engine.cancel(execution_id);
            }
        })
    };

    let result = engine.execute_with_context(&workflow, context).await;
    interrupt.abort();

    stop_recording.cancel();
    if let Some(recorder) = recorder {
        recorder.await.context("Event recorder task failed")?;
    }

    let report = result?;

    for phase in &report.phases {
        for step_id in phase {
            print_step(&report, step_id);
        }
    }
    let mut unrun: Vec<&String> = report
        .step_results
        .iter()
        .filter(|(_, r)| matches!(r.status, StepStatus::Skipped | StepStatus::Blocked))
        .filter(|(id, _)| !report.phases.iter().flatten().any(|p| p == *id))
        .map(|(id, _)| id)
        .collect();
    unrun.sort();
    for step_id in unrun {
        print_step(&report, step_id);
    }

    match &report.status {
        ExecutionStatus::Completed => {
            eprintln!("\n[Execution {} completed successfully]", report.execution_id);
        }
        ExecutionStatus::Failed { error } => {
            eprintln!("\n[Execution {} failed: {}]", report.execution_id, error);
            std::process::exit(1);
        }
        ExecutionStatus::Cancelled => {
            eprintln!("\n[Execution {} cancelled]", report.execution_id);
            std::process::exit(130);
        }
        ExecutionStatus::Running => {
            eprintln!("\n[Execution {} in state: {:?}]", report.execution_id, report.status);
        }
    }

    Ok(())
}

fn print_step(report: &ExecutionReport, step_id: &str) {
    let Some(result) = report.result(step_id) else {
        return;
    };
    let status = serde_json::to_value(result.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", result.status));

    println!(
        "{:<24} {:<10} {:>8}ms  {}",
        step_id,
        status,
        result.execution_time.as_millis(),
        result.error.as_deref().unwrap_or("")
    );
}

/// Print the dependency phases of a workflow
fn show_plan(resolved: &ResolvedConfig, path: &Path) -> Result<()> {
    let workflow = Workflow::from_file(path)?;
    let engine = build_engine(resolved, &EventBus::new())?;
    let phases = engine.plan(&workflow)?;

    println!("Workflow: {}", workflow.name);
    if !workflow.description.is_empty() {
        println!("{}", workflow.description);
    }
    println!();
    for phase in &phases {
        let mode = if phase.parallel { "parallel" } else { "sequential" };
        println!("Phase {} ({}): {}", phase.index, mode, phase.step_ids.join(", "));
    }

    Ok(())
}

fn validate_workflow(path: &Path) -> Result<()> {
    let workflow = Workflow::from_file(path)?;
    workflow
        .validate()
        .with_context(|| format!("Workflow '{}' is invalid", workflow.name))?;

    println!("Workflow '{}' is valid ({} top-level steps)", workflow.name, workflow.steps.len());
    Ok(())
}

/// Replay an event log, one line per event
async fn show_events(path: &Path, name: Option<&str>) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Event log not found: {}", path.display());
    }

    let log = EventLog::open(path).await?;
    let events = match name {
        Some(name) => log.find_events(|e| e.name() == name).await?,
        None => log.replay().await?,
    };

    if events.is_empty() {
        println!("No events found");
        return Ok(());
    }

    for event in events {
        let payload = serde_json::to_string(&event.payload).context("Failed to serialize event")?;
        println!(
            "{}  {:<32} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.name(),
            payload
        );
    }

    Ok(())
}

fn show_config(resolved: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        resolved
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();

    let yaml = serde_yaml::to_string(&resolved.config).context("Failed to render configuration")?;
    print!("{}", yaml);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("cpu=91").unwrap(), ("cpu".to_string(), json!(91)));
        assert_eq!(
            parse_var("region=eu-west").unwrap(),
            ("region".to_string(), json!("eu-west"))
        );
        assert_eq!(parse_var("flag=true").unwrap().1, json!(true));
        assert_eq!(parse_var("expr=a=b").unwrap().1, json!("a=b"));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from([
            "mender", "run", "wf.yaml", "--var", "cpu=90", "--var", "env=prod", "--events", "out.jsonl",
        ]);
        match cli.command {
            Commands::Run { workflow, vars, events } => {
                assert_eq!(workflow, PathBuf::from("wf.yaml"));
                assert_eq!(vars, vec!["cpu=90", "env=prod"]);
                assert_eq!(events, Some(PathBuf::from("out.jsonl")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
