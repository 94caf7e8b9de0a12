//! Step and project results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::CommandKind;
use crate::context::ProjectContext;
use crate::plan_summary::PlanSummary;
use crate::policy::PolicySetStatus;

/// Classification of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// Ran and reported failure (non-zero exit, timeout, policy failure).
    Failed,
    /// Could not be attempted (missing binary, bad directory, cancelled).
    Errored,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Errored => "errored",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a step did not succeed, beyond a plain non-zero exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepFault {
    Timeout { limit_secs: u64 },
    Cancelled,
    Environment { reason: String },
    /// In-process step rejected the request (e.g. approval by a non-owner).
    Rejected { reason: String },
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step label, e.g. `plan` or `env:REGION`.
    pub step: String,
    pub status: StepStatus,
    /// Process exit code, when a process ran to completion.
    pub exit_code: Option<i32>,
    /// Captured stdout followed by stderr, possibly truncated.
    pub output: String,
    pub duration_ms: u64,
    pub best_effort: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<StepFault>,
}

impl StepResult {
    pub fn succeeded(step: impl Into<String>, output: String, duration_ms: u64) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Succeeded,
            exit_code: Some(0),
            output,
            duration_ms,
            best_effort: false,
            fault: None,
        }
    }

    pub fn errored(step: impl Into<String>, fault: StepFault, duration_ms: u64) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Errored,
            exit_code: None,
            output: String::new(),
            duration_ms,
            best_effort: false,
            fault: Some(fault),
        }
    }

    pub fn skipped(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            output: reason.into(),
            duration_ms: 0,
            best_effort: false,
            fault: None,
        }
    }

    /// Whether this step passed (succeeded or skipped).
    pub fn passed(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded | StepStatus::Skipped)
    }

    /// Whether this step stops the pipeline.
    pub fn aborts_pipeline(&self) -> bool {
        !self.passed() && !self.best_effort
    }
}

/// Overall outcome of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Success,
    Failure,
    Error,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Success => "success",
            ProjectStatus::Failure => "failure",
            ProjectStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Why an invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureCause {
    /// Workflow could not be resolved or is malformed.
    Configuration { message: String },
    /// The project lock is held by another invocation.
    Contention {
        holder: Uuid,
        holder_command: CommandKind,
        held_since: DateTime<Utc>,
    },
    /// A step ran and failed.
    StepFailed {
        step: String,
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Timeout { step: String, limit_secs: u64 },
    /// The system could not run a step at all.
    Environment { step: String, reason: String },
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },
}

impl FailureCause {
    /// Status an invocation ends with for this cause.
    pub fn status(&self) -> ProjectStatus {
        match self {
            FailureCause::Contention { .. }
            | FailureCause::StepFailed { .. }
            | FailureCause::Timeout { .. } => ProjectStatus::Failure,
            FailureCause::Configuration { .. }
            | FailureCause::Environment { .. }
            | FailureCause::Cancelled { .. } => ProjectStatus::Error,
        }
    }

    /// Derive the cause for a step that aborted the pipeline.
    pub fn from_step(result: &StepResult) -> Self {
        match &result.fault {
            Some(StepFault::Timeout { limit_secs }) => FailureCause::Timeout {
                step: result.step.clone(),
                limit_secs: *limit_secs,
            },
            Some(StepFault::Cancelled) => FailureCause::Cancelled {
                step: Some(result.step.clone()),
            },
            Some(StepFault::Environment { reason }) => FailureCause::Environment {
                step: result.step.clone(),
                reason: reason.clone(),
            },
            Some(StepFault::Rejected { reason }) => FailureCause::StepFailed {
                step: result.step.clone(),
                exit_code: None,
                reason: Some(reason.clone()),
            },
            None => FailureCause::StepFailed {
                step: result.step.clone(),
                exit_code: result.exit_code,
                reason: None,
            },
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Configuration { message } => write!(f, "configuration error: {message}"),
            FailureCause::Contention {
                holder,
                holder_command,
                held_since,
            } => write!(
                f,
                "locked, held since {}, held by {holder} ({holder_command})",
                held_since.to_rfc3339()
            ),
            FailureCause::StepFailed {
                step,
                exit_code,
                reason,
            } => match (reason, exit_code) {
                (Some(reason), _) => write!(f, "step {step} failed: {reason}"),
                (None, Some(code)) => write!(f, "step {step} exited with code {code}"),
                (None, None) => write!(f, "step {step} failed"),
            },
            FailureCause::Timeout { step, limit_secs } => {
                write!(f, "step {step} timed out after {limit_secs}s")
            }
            FailureCause::Environment { step, reason } => {
                write!(f, "step {step} could not run: {reason}")
            }
            FailureCause::Cancelled { step: Some(step) } => {
                write!(f, "cancelled during step {step}")
            }
            FailureCause::Cancelled { step: None } => f.write_str("cancelled"),
        }
    }
}

/// Aggregate outcome handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectResult {
    pub invocation_id: Uuid,
    pub command: CommandKind,
    pub repo_full_name: String,
    pub repo_rel_dir: String,
    pub workspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub workflow: String,
    pub status: ProjectStatus,
    /// Steps actually attempted, in order.
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<PlanSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_status: Vec<PolicySetStatus>,
    pub duration_ms: u64,
    /// Human-readable rendering of everything above.
    pub output: String,
}

impl ProjectResult {
    /// Assemble a result for `command` on `ctx`. `output` is rendered from
    /// the other fields; a cause decides the status, no cause means success.
    pub fn new(
        ctx: &ProjectContext,
        command: CommandKind,
        invocation_id: Uuid,
        workflow: impl Into<String>,
        steps: Vec<StepResult>,
        cause: Option<FailureCause>,
        duration_ms: u64,
    ) -> Self {
        let status = cause
            .as_ref()
            .map(FailureCause::status)
            .unwrap_or(ProjectStatus::Success);
        let mut result = Self {
            invocation_id,
            command,
            repo_full_name: ctx.repo_full_name.clone(),
            repo_rel_dir: ctx.repo_rel_dir.clone(),
            workspace: ctx.workspace.clone(),
            project_name: ctx.project_name.clone(),
            workflow: workflow.into(),
            status,
            steps,
            cause,
            plan_summary: None,
            policy_status: Vec::new(),
            duration_ms,
            output: String::new(),
        };
        result.output = result.render();
        result
    }

    pub fn with_plan_summary(mut self, summary: Option<PlanSummary>) -> Self {
        self.plan_summary = summary;
        self.output = self.render();
        self
    }

    pub fn with_policy_status(mut self, status: Vec<PolicySetStatus>) -> Self {
        self.policy_status = status;
        self.output = self.render();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ProjectStatus::Success
    }

    /// Number of steps that passed.
    pub fn passed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.passed()).count()
    }

    /// Number of steps that failed or errored.
    pub fn failed_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.passed()).count()
    }

    /// Render for direct display: a header, each attempted step with its
    /// own output block, then the summary and cause.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let project = match &self.project_name {
            Some(name) => format!("{name} "),
            None => String::new(),
        };
        out.push_str(&format!(
            "{} {}{} {}/{}: {}\n",
            self.command,
            project,
            self.repo_full_name,
            self.repo_rel_dir,
            self.workspace,
            self.status
        ));
        for step in &self.steps {
            let mut detail = step.status.to_string();
            if let Some(code) = step.exit_code {
                detail.push_str(&format!(", exit {code}"));
            }
            if step.best_effort {
                detail.push_str(", best effort");
            }
            out.push_str(&format!(
                "--- {} ({detail}, {}ms) ---\n",
                step.step, step.duration_ms
            ));
            if !step.output.is_empty() {
                out.push_str(&step.output);
                if !step.output.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        if let Some(summary) = &self.plan_summary {
            out.push_str(&format!("plan: {summary}\n"));
        }
        for policy in &self.policy_status {
            let verdict = if policy.passed {
                "passed".to_string()
            } else {
                format!(
                    "failed, {}/{} approvals",
                    policy.approvals, policy.approvals_required
                )
            };
            out.push_str(&format!("policy {}: {verdict}\n", policy.name));
        }
        if let Some(cause) = &self.cause {
            out.push_str(&format!("cause: {cause}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ProjectContext {
        ProjectContext::new("acme/infra", "/checkout", CommandKind::Plan).with_dir("envs/prod")
    }

    fn failed_step(name: &str, code: i32) -> StepResult {
        StepResult {
            step: name.to_string(),
            status: StepStatus::Failed,
            exit_code: Some(code),
            output: "boom".to_string(),
            duration_ms: 5,
            best_effort: false,
            fault: None,
        }
    }

    #[test]
    fn test_no_cause_is_success() {
        let r = ProjectResult::new(
            &ctx(),
            CommandKind::Plan,
            Uuid::new_v4(),
            "default",
            vec![StepResult::succeeded("init", "ok".into(), 3)],
            None,
            3,
        );
        assert!(r.is_success());
        assert_eq!(r.passed_count(), 1);
        assert_eq!(r.failed_count(), 0);
        assert!(r.output.contains("plan acme/infra envs/prod/default: success"));
        assert!(r.output.contains("--- init (succeeded, exit 0, 3ms) ---\nok\n"));
    }

    #[test]
    fn test_cause_decides_status() {
        let step = failed_step("plan", 1);
        let cause = FailureCause::from_step(&step);
        assert_eq!(cause.status(), ProjectStatus::Failure);
        assert_eq!(cause.to_string(), "step plan exited with code 1");

        let r = ProjectResult::new(
            &ctx(),
            CommandKind::Plan,
            Uuid::new_v4(),
            "default",
            vec![step],
            Some(cause),
            5,
        );
        assert_eq!(r.status, ProjectStatus::Failure);
        assert!(r.output.ends_with("cause: step plan exited with code 1\n"));
    }

    #[test]
    fn test_step_faults_map_to_causes() {
        let timeout = StepResult {
            fault: Some(StepFault::Timeout { limit_secs: 30 }),
            ..failed_step("apply", -1)
        };
        assert_eq!(
            FailureCause::from_step(&timeout),
            FailureCause::Timeout {
                step: "apply".into(),
                limit_secs: 30
            }
        );

        let env = StepResult::errored(
            "init",
            StepFault::Environment {
                reason: "terraform: not found".into(),
            },
            0,
        );
        let cause = FailureCause::from_step(&env);
        assert_eq!(cause.status(), ProjectStatus::Error);
        assert!(cause.to_string().contains("could not run"));

        let cancelled = StepResult::errored("plan", StepFault::Cancelled, 0);
        assert_eq!(
            FailureCause::from_step(&cancelled).status(),
            ProjectStatus::Error
        );
    }

    #[test]
    fn test_contention_display() {
        let holder = Uuid::new_v4();
        let cause = FailureCause::Contention {
            holder,
            holder_command: CommandKind::Plan,
            held_since: Utc::now(),
        };
        let msg = cause.to_string();
        assert!(msg.starts_with("locked, held since "));
        assert!(msg.contains(&holder.to_string()));
        assert!(msg.contains("(plan)"));
    }

    #[test]
    fn test_best_effort_failure_does_not_abort() {
        let mut step = failed_step("run", 2);
        assert!(step.aborts_pipeline());
        step.best_effort = true;
        assert!(!step.aborts_pipeline());
        assert!(!step.passed());
    }

    #[test]
    fn test_render_includes_summary_and_policies() {
        let r = ProjectResult::new(
            &ctx(),
            CommandKind::Plan,
            Uuid::new_v4(),
            "default",
            vec![],
            None,
            0,
        )
        .with_plan_summary(Some(PlanSummary {
            add: 1,
            ..Default::default()
        }))
        .with_policy_status(vec![PolicySetStatus {
            name: "cost".into(),
            passed: false,
            approvals: 0,
            approvals_required: 1,
        }]);
        assert!(r.output.contains("plan: 1 to add, 0 to change, 0 to destroy."));
        assert!(r.output.contains("policy cost: failed, 0/1 approvals"));
    }

    #[test]
    fn test_result_serializes_to_json() {
        let r = ProjectResult::new(
            &ctx(),
            CommandKind::Plan,
            Uuid::new_v4(),
            "default",
            vec![],
            Some(FailureCause::Cancelled { step: None }),
            0,
        );
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["cause"]["type"], "cancelled");
        assert_eq!(json["command"], "plan");
    }
}
