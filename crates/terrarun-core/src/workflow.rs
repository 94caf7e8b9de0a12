//! Workflow and step definitions.
//!
//! Steps are plain data so that workflows can come from repository
//! configuration without recompiling anything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, RunnerError};

/// What a step does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    /// `<tool> init -input=false`
    Init,
    /// `<tool> plan -input=false -refresh -out <planfile>`
    Plan,
    /// `<tool> show -json <planfile>`, written to the show file.
    Show,
    /// `<tool> apply -input=false <planfile>`
    Apply,
    /// Run the policy tool against the show file, once per policy set.
    PolicyCheck,
    /// Record the calling user's approval on failing policy sets they own.
    ApprovePolicies,
    /// `<tool> import -input=false`
    Import,
    /// `<tool> state rm`
    StateRm,
    /// `<tool> version`
    Version,
    /// Arbitrary shell command.
    Run { command: String },
    /// Set an environment variable for every following step, from a literal
    /// value or from the trimmed stdout of a shell command.
    Env {
        name: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        command: Option<String>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Init => "init",
            StepKind::Plan => "plan",
            StepKind::Show => "show",
            StepKind::Apply => "apply",
            StepKind::PolicyCheck => "policy_check",
            StepKind::ApprovePolicies => "approve_policies",
            StepKind::Import => "import",
            StepKind::StateRm => "state_rm",
            StepKind::Version => "version",
            StepKind::Run { .. } => "run",
            StepKind::Env { .. } => "env",
        }
    }

    /// Whether the user's extra arguments are appended to this step.
    pub fn accepts_extra_args(&self) -> bool {
        matches!(
            self,
            StepKind::Plan | StepKind::Apply | StepKind::Import | StepKind::StateRm
        )
    }
}

/// One unit of work in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,

    /// Extra arguments appended after the step's fixed arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment for this step only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// A failing best-effort step is recorded but does not stop the pipeline.
    #[serde(default)]
    pub best_effort: bool,

    /// Overrides the runner's default step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            args: Vec::new(),
            env: BTreeMap::new(),
            best_effort: false,
            timeout_secs: None,
        }
    }

    pub fn run(command: impl Into<String>) -> Self {
        Self::new(StepKind::Run {
            command: command.into(),
        })
    }

    pub fn env_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(StepKind::Env {
            name: name.into(),
            value: Some(value.into()),
            command: None,
        })
    }

    pub fn env_command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(StepKind::Env {
            name: name.into(),
            value: None,
            command: Some(command.into()),
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Label used in results: the kind name, plus the variable for env steps.
    pub fn label(&self) -> String {
        match &self.kind {
            StepKind::Env { name, .. } => format!("env:{name}"),
            other => other.name().to_string(),
        }
    }

    /// Reject definitions that cannot possibly run.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match &self.kind {
            StepKind::Run { command } if command.trim().is_empty() => {
                return Err("run step has an empty command".to_string());
            }
            StepKind::Env {
                name,
                value,
                command,
            } => {
                if !is_env_name(name) {
                    return Err(format!("env step has invalid variable name {name:?}"));
                }
                match (value, command) {
                    (Some(_), None) => {}
                    (None, Some(c)) if !c.trim().is_empty() => {}
                    (None, Some(_)) => {
                        return Err(format!("env step {name} has an empty command"));
                    }
                    _ => {
                        return Err(format!(
                            "env step {name} needs exactly one of value or command"
                        ));
                    }
                }
            }
            _ => {}
        }
        if self.timeout_secs == Some(0) {
            return Err("timeout_secs must be greater than zero".to_string());
        }
        if let Some(bad) = self.env.keys().find(|k| !is_env_name(k)) {
            return Err(format!("invalid environment variable name {bad:?}"));
        }
        Ok(())
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// An ordered pipeline of steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Validate every step, reporting the first bad one.
    pub fn validate(&self) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|reason| RunnerError::InvalidStep {
                workflow: self.name.clone(),
                index,
                reason,
            })?;
        }
        Ok(())
    }

    /// SHA-256 over the ordered step definitions.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for step in &self.steps {
            // Step serialization is infallible: no maps with non-string keys.
            let encoded = serde_json::to_vec(step).unwrap_or_default();
            hasher.update(&encoded);
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}
