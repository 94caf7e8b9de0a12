//! Lock identity: which project state a command touches.

use serde::{Deserialize, Serialize};

/// Identity of one project's state: (repository, directory, workspace).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    /// Repository full name, e.g. `owner/repo`.
    pub repo_full_name: String,
    /// Project directory relative to the repository root.
    pub path: String,
    /// Workspace name.
    pub workspace: String,
}

impl LockKey {
    pub fn new(
        repo_full_name: impl Into<String>,
        path: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            path: normalize_rel_dir(&path.into()),
            workspace: workspace.into(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.repo_full_name, self.path, self.workspace)
    }
}

/// Independent lock namespaces on the same [`LockKey`].
///
/// Policy approvals only touch approval state, so they never contend with a
/// plan or apply running on the same project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockDomain {
    Project,
    PolicyApproval,
}

impl std::fmt::Display for LockDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockDomain::Project => f.write_str("project"),
            LockDomain::PolicyApproval => f.write_str("policy_approval"),
        }
    }
}

/// Normalize a repo-relative directory: `""`, `"./"` and `"."` all mean the
/// root; trailing and leading separators are dropped.
pub fn normalize_rel_dir(dir: &str) -> String {
    let parts: Vec<&str> = dir
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
