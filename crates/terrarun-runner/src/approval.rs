//! In-process policy approval.

use terrarun_core::{PolicySetStatus, ProjectContext, StepFault, StepResult, StepStatus};

/// Record one approval from `ctx.user` on every failing policy set they own.
///
/// Returns the step result and the updated policy outcomes. A user who owns
/// none of the failing sets is rejected and nothing changes.
pub fn approve_policies(ctx: &ProjectContext, label: &str) -> (StepResult, Vec<PolicySetStatus>) {
    let current = ctx.policy_status.clone();
    if current.is_empty() {
        return (
            StepResult::skipped(label, "no policy check results to approve"),
            current,
        );
    }
    if current.iter().all(PolicySetStatus::is_satisfied) {
        return (
            StepResult::succeeded(label, "all policies passed or are approved".into(), 0),
            current,
        );
    }

    let owns = |status: &PolicySetStatus| {
        ctx.policy_sets
            .iter()
            .any(|set| set.name == status.name && set.is_owner(&ctx.user))
    };

    let mut updated = current.clone();
    let mut approved = Vec::new();
    for status in updated.iter_mut().filter(|s| !s.is_satisfied()) {
        if owns(status) {
            status.approvals += 1;
            approved.push(status.name.clone());
        }
    }

    if approved.is_empty() {
        let reason = format!(
            "user {} is not an owner of any failing policy set",
            if ctx.user.is_empty() {
                "<unknown>"
            } else {
                ctx.user.as_str()
            }
        );
        let result = StepResult {
            step: label.to_string(),
            status: StepStatus::Failed,
            exit_code: None,
            output: reason.clone(),
            duration_ms: 0,
            best_effort: false,
            fault: Some(StepFault::Rejected { reason }),
        };
        return (result, current);
    }

    let mut output = format!("approved by {}: {}\n", ctx.user, approved.join(", "));
    for status in &updated {
        let state = if status.passed {
            "passed".to_string()
        } else {
            format!("{}/{} approvals", status.approvals, status.approvals_required)
        };
        output.push_str(&format!("  {}: {state}\n", status.name));
    }
    (StepResult::succeeded(label, output, 0), updated)
}
