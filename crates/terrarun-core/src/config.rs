//! Runner and repository configuration.
//!
//! Both are TOML documents. `RunnerConfig` tunes how steps are executed on
//! this host; `RepoConfig` carries the named workflows a repository defines.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command::CommandKind;
use crate::error::ConfigError;
use crate::workflow::{Step, Workflow};

/// Default cap on captured output per step (1 MiB).
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Host-level execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Infrastructure tool executable (`terraform`, `tofu`, or an absolute path).
    pub tool_binary: String,
    /// Policy tool executable.
    pub policy_binary: String,
    /// Shell used for `run` and `env` steps, invoked as `<shell> -c <command>`.
    pub shell: String,
    /// Captured output kept per step before truncation.
    pub output_limit_bytes: usize,
    /// Default timeout for a single step. `None` = unbounded.
    pub step_timeout_secs: Option<u64>,
    /// Timeout for the whole pipeline. `None` = unbounded.
    pub pipeline_timeout_secs: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tool_binary: "terraform".to_string(),
            policy_binary: "conftest".to_string(),
            shell: "sh".to_string(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            step_timeout_secs: None,
            pipeline_timeout_secs: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tool_binary.trim().is_empty() {
            return Err(ConfigError::Invalid("tool_binary must not be empty".into()));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".into()));
        }
        if self.output_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "output_limit_bytes must be greater than zero".into(),
            ));
        }
        if self.step_timeout_secs == Some(0) || self.pipeline_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// A named workflow: one optional step list per configurable command.
///
/// A stage that is present replaces the built-in steps for that command
/// entirely; an absent stage keeps the built-in steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<Vec<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_check: Option<Vec<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<Vec<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_rm: Option<Vec<Step>>,
}

impl WorkflowDef {
    /// The configured stage for `kind`, if this workflow defines one.
    ///
    /// Version and policy approval are not configurable.
    pub fn stage(&self, kind: CommandKind) -> Option<&[Step]> {
        let stage = match kind {
            CommandKind::Plan => &self.plan,
            CommandKind::Apply => &self.apply,
            CommandKind::PolicyCheck => &self.policy_check,
            CommandKind::Import => &self.import,
            CommandKind::StateRm => &self.state_rm,
            CommandKind::ApprovePolicies | CommandKind::Version => return None,
        };
        stage.as_deref()
    }
}

/// Repository-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoConfig {
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowDef>,
}

impl RepoConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn with_workflow(mut self, name: impl Into<String>, def: WorkflowDef) -> Self {
        self.workflows.insert(name.into(), def);
        self
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowDef> {
        self.workflows.get(name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, def) in &self.workflows {
            for kind in CommandKind::ALL {
                if let Some(steps) = def.stage(kind) {
                    Workflow::new(format!("{name}.{kind}"), steps.to_vec())
                        .validate()
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                }
            }
        }
        Ok(())
    }
}

/// Supplies repository configuration for a project.
pub trait RepoConfigProvider: Send + Sync {
    /// Configuration for the project at `repo_rel_dir` in `repo_full_name`,
    /// or `None` when the repository defines nothing.
    fn repo_config(&self, repo_full_name: &str, repo_rel_dir: &str) -> Option<Arc<RepoConfig>>;
}

/// The same configuration (or none) for every project.
#[derive(Debug, Clone, Default)]
pub struct StaticRepoConfig {
    config: Option<Arc<RepoConfig>>,
}

impl StaticRepoConfig {
    pub fn new(config: RepoConfig) -> Self {
        Self {
            config: Some(Arc::new(config)),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl RepoConfigProvider for StaticRepoConfig {
    fn repo_config(&self, _repo_full_name: &str, _repo_rel_dir: &str) -> Option<Arc<RepoConfig>> {
        self.config.clone()
    }
}
