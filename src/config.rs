//! Configuration for mender.
//!
//! Configuration sources (highest priority first):
//! 1. Explicit path (`--config` or MENDER_CONFIG)
//! 2. Config file (.mender/config.yaml in the current directory or a parent)
//! 3. User config file (~/.mender/config.yaml)
//! 4. Defaults
//!
//! Every field has a default, so a config file only needs the settings it
//! changes. The resolved configuration is passed into constructors; nothing
//! here is cached globally.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{
    CircuitBreakerConfig, Capacity, CoreError, EngineConfig, HealingConfig, RetryPolicy,
};

/// Directory name searched for in the working tree and home directory
const CONFIG_DIR: &str = ".mender";
const CONFIG_FILE: &str = "config.yaml";

/// Config file schema (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenderConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Resource pool capacity
    #[serde(default)]
    pub resources: Capacity,

    /// Default retry policy for steps that declare none
    #[serde(default = "RetryPolicy::none")]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub healing: HealingConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for MenderConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            resources: Capacity::default(),
            retry: RetryPolicy::none(),
            healing: HealingConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl MenderConfig {
    /// Parse configuration from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config YAML")
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<(), CoreError> {
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(CoreError::validation("circuit_breaker.failure_threshold must be at least 1"));
        }
        if cb.reset_timeout_ms == 0 {
            return Err(CoreError::validation("circuit_breaker.reset_timeout_ms must be positive"));
        }

        if self.resources.workers == 0 {
            return Err(CoreError::validation("resources.workers must be at least 1"));
        }
        if self.resources.cpu <= 0.0 {
            return Err(CoreError::validation("resources.cpu must be positive"));
        }

        if self.retry.max_attempts == 0 {
            return Err(CoreError::validation("retry.max_attempts must be at least 1"));
        }

        let healing = &self.healing;
        for (name, value) in [
            ("healing.monitoring_interval_ms", healing.monitoring_interval_ms),
            ("healing.recovery_timeout_ms", healing.recovery_timeout_ms),
            ("healing.action_timeout_ms", healing.action_timeout_ms),
            ("engine.step_timeout_ms", self.engine.step_timeout_ms),
        ] {
            if value == 0 {
                return Err(CoreError::validation(format!("{} must be positive", name)));
            }
        }
        if !(0.0..=1.0).contains(&healing.preventive_action_threshold) {
            return Err(CoreError::validation(format!(
                "healing.preventive_action_threshold must be within [0, 1], got {}",
                healing.preventive_action_threshold
            )));
        }
        if healing.pattern_window == 0 || healing.min_pattern_frequency == 0 {
            return Err(CoreError::validation(
                "healing.pattern_window and healing.min_pattern_frequency must be at least 1",
            ));
        }
        if healing.scale_factor <= 0.0 || healing.max_scale_factor < healing.scale_factor {
            return Err(CoreError::validation(
                "healing.scale_factor must be positive and no larger than max_scale_factor",
            ));
        }

        Ok(())
    }
}

/// Configuration together with where it came from
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: MenderConfig,

    /// Path to config file (if one was found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// User-level config file, if it exists
fn user_config_file() -> Option<PathBuf> {
    let path = dirs::home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE);
    path.exists().then_some(path)
}

/// Load, parse and validate a config file
pub fn load_config_file(path: &Path) -> Result<MenderConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = MenderConfig::from_yaml(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Resolve configuration from all sources.
///
/// `explicit` is the `--config` flag (clap fills it from MENDER_CONFIG too).
/// An explicit path that does not exist is an error; discovered files are
/// optional.
pub fn load_config(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let config_file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            find_config_file(&cwd).or_else(user_config_file)
        }
    };

    let config = match &config_file {
        Some(path) => load_config_file(path)?,
        None => MenderConfig::default(),
    };

    Ok(ResolvedConfig {
        config,
        config_file,
    })
}
