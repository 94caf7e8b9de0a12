//! Workflow resolution: built-in defaults overlaid by repository workflows.

use terrarun_core::{
    CommandKind, RepoConfig, Result, RunnerError, Step, StepKind, Workflow, DEFAULT_WORKFLOW,
};
use tracing::debug;

/// Picks the steps a command runs.
pub struct WorkflowResolver;

impl WorkflowResolver {
    /// Built-in steps for `kind`.
    pub fn default_steps(kind: CommandKind) -> Vec<Step> {
        let kinds = match kind {
            CommandKind::Plan => vec![StepKind::Init, StepKind::Plan],
            CommandKind::Apply => vec![StepKind::Apply],
            CommandKind::PolicyCheck => vec![StepKind::Show, StepKind::PolicyCheck],
            CommandKind::ApprovePolicies => vec![StepKind::ApprovePolicies],
            CommandKind::Import => vec![StepKind::Init, StepKind::Import],
            CommandKind::StateRm => vec![StepKind::Init, StepKind::StateRm],
            CommandKind::Version => vec![StepKind::Version],
        };
        kinds.into_iter().map(Step::new).collect()
    }

    /// Resolve the workflow `name` for `kind`.
    ///
    /// An empty name means `default`. A repository workflow with the same
    /// name replaces the built-in steps for every stage it defines; stages it
    /// leaves out keep the built-in steps. Any name other than `default` must
    /// exist in `repo`.
    pub fn resolve(kind: CommandKind, name: &str, repo: Option<&RepoConfig>) -> Result<Workflow> {
        let name = if name.trim().is_empty() {
            DEFAULT_WORKFLOW
        } else {
            name.trim()
        };

        let def = repo.and_then(|r| r.workflow(name));
        if def.is_none() && name != DEFAULT_WORKFLOW {
            return Err(RunnerError::WorkflowNotFound {
                name: name.to_string(),
            });
        }

        let steps = match def.and_then(|d| d.stage(kind)) {
            Some(stage) => {
                debug!(workflow = %name, command = %kind, "using repository stage");
                stage.to_vec()
            }
            None => Self::default_steps(kind),
        };

        let workflow = Workflow::new(name, steps);
        workflow.validate()?;
        Ok(workflow)
    }
}
