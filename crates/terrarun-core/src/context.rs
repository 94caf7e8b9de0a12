//! Execution context for one (project, command) invocation.

use std::path::{Path, PathBuf};

use crate::cancel::CancelSignal;
use crate::command::CommandKind;
use crate::key::{normalize_rel_dir, LockKey};
use crate::policy::{PolicySet, PolicySetStatus};

/// Name of the built-in workspace and of the built-in workflow.
pub const DEFAULT_WORKSPACE: &str = "default";
pub const DEFAULT_WORKFLOW: &str = "default";

/// Everything the runner needs to know about one invocation.
///
/// Built once by the caller and only read afterwards; the runner takes it by
/// shared reference.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    /// Repository full name, `owner/name`.
    pub repo_full_name: String,
    /// Where the repository is checked out at `head_commit`.
    pub repo_dir: PathBuf,
    /// Project directory relative to `repo_dir`, normalized (`.` = root).
    pub repo_rel_dir: String,
    pub workspace: String,
    pub project_name: Option<String>,
    pub command: CommandKind,

    pub pull_num: u64,
    pub pull_author: String,
    pub base_branch: String,
    pub head_branch: String,
    pub base_commit: String,
    pub head_commit: String,

    /// User who issued the command.
    pub user: String,
    /// Flags the user appended to the command.
    pub extra_args: Vec<String>,
    /// Workflow to resolve; `default` selects the built-in pipeline.
    pub workflow: String,

    pub policy_sets: Vec<PolicySet>,
    /// Policy outcomes from the last policy check, consumed by approvals.
    pub policy_status: Vec<PolicySetStatus>,

    pub cancel: CancelSignal,
}

impl ProjectContext {
    pub fn new(
        repo_full_name: impl Into<String>,
        repo_dir: impl Into<PathBuf>,
        command: CommandKind,
    ) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            repo_dir: repo_dir.into(),
            repo_rel_dir: ".".to_string(),
            workspace: DEFAULT_WORKSPACE.to_string(),
            project_name: None,
            command,
            pull_num: 0,
            pull_author: String::new(),
            base_branch: String::new(),
            head_branch: String::new(),
            base_commit: String::new(),
            head_commit: String::new(),
            user: String::new(),
            extra_args: Vec::new(),
            workflow: DEFAULT_WORKFLOW.to_string(),
            policy_sets: Vec::new(),
            policy_status: Vec::new(),
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_dir(mut self, repo_rel_dir: &str) -> Self {
        self.repo_rel_dir = normalize_rel_dir(repo_rel_dir);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = Some(name.into());
        self
    }

    pub fn with_command(mut self, command: CommandKind) -> Self {
        self.command = command;
        self
    }

    pub fn with_pull(mut self, pull_num: u64, author: impl Into<String>) -> Self {
        self.pull_num = pull_num;
        self.pull_author = author.into();
        self
    }

    pub fn with_branches(mut self, base: impl Into<String>, head: impl Into<String>) -> Self {
        self.base_branch = base.into();
        self.head_branch = head.into();
        self
    }

    pub fn with_commits(mut self, base: impl Into<String>, head: impl Into<String>) -> Self {
        self.base_commit = base.into();
        self.head_commit = head.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = workflow.into();
        self
    }

    pub fn with_policy_set(mut self, set: PolicySet) -> Self {
        self.policy_sets.push(set);
        self
    }

    pub fn with_policy_status(mut self, status: Vec<PolicySetStatus>) -> Self {
        self.policy_status = status;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::new(&self.repo_full_name, &self.repo_rel_dir, &self.workspace)
    }

    /// Absolute directory the project's steps run in.
    pub fn project_dir(&self) -> PathBuf {
        if self.repo_rel_dir == "." {
            self.repo_dir.clone()
        } else {
            self.repo_dir.join(Path::new(&self.repo_rel_dir))
        }
    }

    /// `<project>-<workspace>.tfplan`, or `<workspace>.tfplan` for unnamed
    /// projects. Slashes in project names become `::`.
    pub fn plan_file_name(&self) -> String {
        match &self.project_name {
            Some(name) if !name.is_empty() => {
                format!("{}-{}.tfplan", name.replace('/', "::"), self.workspace)
            }
            _ => format!("{}.tfplan", self.workspace),
        }
    }

    pub fn plan_file(&self) -> PathBuf {
        self.project_dir().join(self.plan_file_name())
    }

    /// JSON rendering of the plan consumed by policy checks.
    pub fn show_file(&self) -> PathBuf {
        self.project_dir().join(format!("{}.json", self.plan_file_name()))
    }

    /// `(owner, name)` split of the repository full name.
    pub fn repo_owner_and_name(&self) -> (&str, &str) {
        match self.repo_full_name.rsplit_once('/') {
            Some((owner, name)) => (owner, name),
            None => ("", self.repo_full_name.as_str()),
        }
    }

    /// Short label used in logs and rendered output.
    pub fn display_name(&self) -> String {
        match &self.project_name {
            Some(name) => format!("{name} ({}/{})", self.repo_rel_dir, self.workspace),
            None => format!("{}/{}", self.repo_rel_dir, self.workspace),
        }
    }
}
