//! Structured observability hooks for project invocations.
//!
//! This module provides:
//! - The invocation-scoped span the runner instruments each invocation with
//! - Emission functions for lifecycle events: start, step finished, lock
//!   contention, finish
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use tracing::{info, warn};

use crate::command::CommandKind;
use crate::key::LockKey;
use crate::result::{ProjectStatus, StepResult};

/// Span carrying `invocation_id`, `command` and `lock_key`, for
/// instrumenting an invocation's future across await points.
pub fn invocation_span(invocation_id: &str, command: CommandKind, key: &LockKey) -> tracing::Span {
    tracing::info_span!(
        "terrarun.invocation",
        invocation_id = %invocation_id,
        command = %command,
        lock_key = %key,
    )
}

/// Emit event: invocation started with the resolved workflow.
pub fn emit_project_started(workflow: &str, workflow_digest: &str, steps: usize) {
    let short = workflow_digest.get(..12).unwrap_or(workflow_digest);
    info!(
        event = "project.started",
        workflow = %workflow,
        workflow_digest = %short,
        steps = steps,
    );
}

/// Emit event: one step finished.
pub fn emit_step_finished(seq: usize, result: &StepResult) {
    info!(
        event = "project.step_finished",
        seq = seq,
        step = %result.step,
        status = %result.status,
        exit_code = result.exit_code,
        duration_ms = result.duration_ms,
    );
}

/// Emit event: the lock was already held by another invocation.
pub fn emit_lock_contended(key: &LockKey, holder: &dyn std::fmt::Display) {
    info!(event = "lock.contended", lock_key = %key, holder = %holder);
}

/// Emit event: invocation finished.
pub fn emit_project_finished(status: ProjectStatus, steps: usize, duration_ms: u64) {
    info!(
        event = "project.finished",
        status = %status,
        steps = steps,
        duration_ms = duration_ms,
    );
}

/// Emit event: invocation could not resolve its workflow (warning level).
pub fn emit_configuration_error(error: &dyn std::fmt::Display) {
    warn!(event = "project.configuration_error", error = %error);
}
