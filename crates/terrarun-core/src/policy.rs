//! Policy sets and their per-project outcomes.

use serde::{Deserialize, Serialize};

fn default_approvals_required() -> u32 {
    1
}

/// A named set of policies evaluated against a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    pub name: String,
    /// Policy directory handed to the policy tool.
    pub path: String,
    /// Users allowed to approve a failing result for this set.
    #[serde(default)]
    pub owners: Vec<String>,
    /// Approvals needed before a failing set stops blocking apply.
    #[serde(default = "default_approvals_required")]
    pub approvals_required: u32,
}

impl PolicySet {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            owners: Vec::new(),
            approvals_required: default_approvals_required(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owners.push(owner.into());
        self
    }

    pub fn is_owner(&self, user: &str) -> bool {
        self.owners.iter().any(|o| o.eq_ignore_ascii_case(user))
    }
}

/// Outcome of one policy set for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySetStatus {
    pub name: String,
    pub passed: bool,
    pub approvals: u32,
    pub approvals_required: u32,
}

impl PolicySetStatus {
    /// Passing, or failing but approved enough times.
    pub fn is_satisfied(&self) -> bool {
        self.passed || self.approvals >= self.approvals_required
    }
}
