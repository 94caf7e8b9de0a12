//! Command kinds and their per-kind execution table.

use serde::{Deserialize, Serialize};

use crate::key::LockDomain;

/// A command a user can request against a project.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Plan,
    Apply,
    ApprovePolicies,
    Import,
    PolicyCheck,
    StateRm,
    Version,
}

impl CommandKind {
    /// All command kinds, in a stable order.
    pub const ALL: [CommandKind; 7] = [
        CommandKind::Plan,
        CommandKind::Apply,
        CommandKind::ApprovePolicies,
        CommandKind::Import,
        CommandKind::PolicyCheck,
        CommandKind::StateRm,
        CommandKind::Version,
    ];

    /// Get the command name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Plan => "plan",
            CommandKind::Apply => "apply",
            CommandKind::ApprovePolicies => "approve_policies",
            CommandKind::Import => "import",
            CommandKind::PolicyCheck => "policy_check",
            CommandKind::StateRm => "state_rm",
            CommandKind::Version => "version",
        }
    }

    /// The lock domain this command must hold while it runs.
    ///
    /// `None` means the command only reads and runs without a lock.
    pub fn lock_domain(&self) -> Option<LockDomain> {
        match self {
            CommandKind::Plan | CommandKind::Apply | CommandKind::Import | CommandKind::StateRm => {
                Some(LockDomain::Project)
            }
            CommandKind::ApprovePolicies => Some(LockDomain::PolicyApproval),
            CommandKind::PolicyCheck | CommandKind::Version => None,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        CommandKind::ALL
            .into_iter()
            .find(|k| k.name() == normalized)
            .ok_or_else(|| format!("unknown command: {s}"))
    }
}
