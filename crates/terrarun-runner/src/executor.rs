//! Step execution against a project's working directory.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use terrarun_core::{
    PolicySetStatus, ProjectContext, RunnerConfig, Step, StepFault, StepKind, StepResult,
    StepStatus,
};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::approval::approve_policies;
use crate::builtin::{invalidates_plan, standard_env, tool_args, tool_env};

/// What running one step produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    /// Variable set by an `env` step for the following steps.
    pub exported: Option<(String, String)>,
    /// Policy outcomes produced by policy-check or approval steps.
    pub policy_status: Option<Vec<PolicySetStatus>>,
}

impl From<StepResult> for StepOutcome {
    fn from(result: StepResult) -> Self {
        Self {
            result,
            exported: None,
            policy_status: None,
        }
    }
}

/// Runs a single step.
///
/// Implementations run the step to completion. Timeouts and cancellation
/// are applied by the caller, which drops the returned future; anything the
/// step spawned must die with it.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// `env` holds variables exported by earlier `env` steps.
    async fn run(
        &self,
        step: &Step,
        ctx: &ProjectContext,
        env: &BTreeMap<String, String>,
    ) -> StepOutcome;
}

/// Captured output of one child process.
#[derive(Debug)]
struct ProcessOutput {
    exit_code: i32,
    success: bool,
    stdout: String,
    stderr: String,
    /// Bytes read past the capture limit and thrown away.
    omitted: usize,
}

impl ProcessOutput {
    /// stdout followed by stderr.
    fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Keep at most `limit` bytes of `output`, cut on a character boundary, and
/// say how much was dropped.
pub fn truncate_output(output: String, limit: usize) -> String {
    cap_output(output, limit, 0)
}

/// [`truncate_output`] for text whose capture already dropped
/// `already_omitted` bytes. The marker reports both.
fn cap_output(mut output: String, limit: usize, already_omitted: usize) -> String {
    let mut omitted = already_omitted;
    if output.len() > limit {
        let mut cut = limit;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        omitted += output.len() - cut;
        output.truncate(cut);
    }
    if omitted > 0 {
        output.push_str(&format!("\n... [output truncated: {omitted} bytes omitted]"));
    }
    output
}

/// Read `reader` to the end, keeping the first `limit` bytes. The rest is
/// drained so the child never blocks on a full pipe, and only counted.
async fn read_limited<R>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::with_capacity(limit.min(64 * 1024));
    (&mut reader).take(limit as u64).read_to_end(&mut kept).await?;
    let omitted = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok((kept, omitted as usize))
}

/// Kills a step's process group unless disarmed.
///
/// Each step process leads its own group, so pipelines and wrapper scripts
/// it starts share that group. When the step future is dropped on timeout
/// or cancellation the whole tree gets SIGKILL before the runner releases
/// the project lock. There is no SIGTERM grace period: anything still alive
/// after the lock is gone could race the next holder.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// The step exited and closed its output; nothing is left to reap.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            // ESRCH just means the group is already gone.
            match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                Ok(()) => debug!(pgid, "killed step process group"),
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(pgid, error = %e, "failed to kill step process group"),
            }
        }
        #[cfg(not(unix))]
        debug!(pgid, "step process dropped; kill_on_drop covers the direct child only");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Executes steps as child processes of this one.
#[derive(Debug, Clone, Default)]
pub struct ProcessStepExecutor {
    config: RunnerConfig,
}

impl ProcessStepExecutor {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one child process to completion.
    ///
    /// stdout and stderr are read concurrently and each keeps at most
    /// `output_limit_bytes`. With `stdout_to` set, stdout is streamed into
    /// that file in full instead of being captured.
    async fn exec(
        &self,
        program: &str,
        args: &[String],
        dir: &Path,
        env: &BTreeMap<String, String>,
        stdout_to: Option<File>,
    ) -> std::io::Result<ProcessOutput> {
        debug!(program = %program, args = ?args, dir = %dir.display(), "spawning step process");
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;
        // Declared after `child` so it drops first: the group dies before the
        // leader is reaped.
        let mut group = ProcessGroup::new(child.id());

        let limit = self.config.output_limit_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = async move {
            match (stdout, stdout_to) {
                (Some(mut pipe), Some(mut file)) => {
                    tokio::io::copy(&mut pipe, &mut file).await?;
                    file.flush().await?;
                    Ok::<_, std::io::Error>((Vec::new(), 0))
                }
                (Some(pipe), None) => read_limited(pipe, limit).await,
                (None, _) => Ok((Vec::new(), 0)),
            }
        };
        let stderr_task = async move {
            match stderr {
                Some(pipe) => read_limited(pipe, limit).await,
                None => Ok((Vec::new(), 0)),
            }
        };

        let (status, (stdout, stdout_omitted), (stderr, stderr_omitted)) =
            tokio::try_join!(child.wait(), stdout_task, stderr_task)?;
        group.disarm();

        if stdout_omitted > 0 || stderr_omitted > 0 {
            debug!(stdout_omitted, stderr_omitted, "step output over capture limit");
        }
        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            success: status.success(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            omitted: stdout_omitted + stderr_omitted,
        })
    }

    fn spawn_failed(label: &str, program: &str, err: &std::io::Error, started: Instant) -> StepResult {
        StepResult::errored(
            label,
            StepFault::Environment {
                reason: format!("failed to run {program}: {err}"),
            },
            elapsed_ms(started),
        )
    }

    fn finished(&self, label: &str, out: &ProcessOutput, output: String, started: Instant) -> StepResult {
        StepResult {
            step: label.to_string(),
            status: if out.success {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            },
            exit_code: Some(out.exit_code),
            output: cap_output(output, self.config.output_limit_bytes, out.omitted),
            duration_ms: elapsed_ms(started),
            best_effort: false,
            fault: None,
        }
    }

    fn rejected(label: &str, reason: String, started: Instant) -> StepResult {
        StepResult {
            step: label.to_string(),
            status: StepStatus::Failed,
            exit_code: None,
            output: reason.clone(),
            duration_ms: elapsed_ms(started),
            best_effort: false,
            fault: Some(StepFault::Rejected { reason }),
        }
    }

    async fn run_tool(
        &self,
        step: &Step,
        ctx: &ProjectContext,
        env: &BTreeMap<String, String>,
        args: Vec<String>,
        label: &str,
        started: Instant,
    ) -> StepOutcome {
        let dir = ctx.project_dir();
        let plan_file = ctx.plan_file();
        if matches!(step.kind, StepKind::Apply | StepKind::Show) && !plan_file.is_file() {
            return Self::rejected(
                label,
                format!(
                    "no plan found at {}; run plan first",
                    plan_file.display()
                ),
                started,
            )
            .into();
        }

        let mut full_env = tool_env(ctx);
        full_env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        full_env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        // The plan JSON can be far larger than the output cap, so show
        // streams stdout straight into the show file.
        let show_file = ctx.show_file();
        let stdout_to = if step.kind == StepKind::Show {
            match File::create(&show_file).await {
                Ok(file) => Some(file),
                Err(e) => {
                    return StepResult::errored(
                        label,
                        StepFault::Environment {
                            reason: format!("failed to write {}: {e}", show_file.display()),
                        },
                        elapsed_ms(started),
                    )
                    .into();
                }
            }
        } else {
            None
        };

        let program = &self.config.tool_binary;
        let out = match self.exec(program, &args, &dir, &full_env, stdout_to).await {
            Ok(out) => out,
            Err(e) => {
                if step.kind == StepKind::Show {
                    let _ = tokio::fs::remove_file(&show_file).await;
                }
                return Self::spawn_failed(label, program, &e, started).into();
            }
        };

        if step.kind == StepKind::Show {
            if !out.success {
                // A partial document must not feed a later policy check.
                let _ = tokio::fs::remove_file(&show_file).await;
                return self.finished(label, &out, out.stderr.clone(), started).into();
            }
            let note = format!("wrote plan JSON to {}\n{}", show_file.display(), out.stderr);
            return self.finished(label, &out, note, started).into();
        }

        if out.success && invalidates_plan(&step.kind) {
            for stale in [plan_file, show_file] {
                match tokio::fs::remove_file(&stale).await {
                    Ok(()) => debug!(path = %stale.display(), "removed stale plan"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %stale.display(), error = %e, "failed to remove stale plan"),
                }
            }
        }

        self.finished(label, &out, out.combined(), started).into()
    }

    fn shell_env(
        &self,
        step: &Step,
        ctx: &ProjectContext,
        env: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut full_env = standard_env(ctx);
        full_env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        full_env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        full_env
    }

    async fn run_shell(
        &self,
        command: &str,
        step: &Step,
        ctx: &ProjectContext,
        env: &BTreeMap<String, String>,
        started: Instant,
    ) -> Result<ProcessOutput, StepResult> {
        let full_env = self.shell_env(step, ctx, env);
        let args = vec!["-c".to_string(), command.to_string()];
        let program = &self.config.shell;
        self.exec(program, &args, &ctx.project_dir(), &full_env, None)
            .await
            .map_err(|e| Self::spawn_failed(&step.label(), program, &e, started))
    }

    async fn run_policy_check(&self, ctx: &ProjectContext, label: &str, started: Instant) -> StepOutcome {
        if ctx.policy_sets.is_empty() {
            return StepResult::skipped(label, "no policy sets configured").into();
        }
        let show_file = ctx.show_file();
        if !show_file.is_file() {
            return Self::rejected(
                label,
                format!("no plan JSON at {}; run show first", show_file.display()),
                started,
            )
            .into();
        }

        let dir = ctx.project_dir();
        let program = &self.config.policy_binary;
        let mut statuses = Vec::with_capacity(ctx.policy_sets.len());
        let mut output = String::new();
        let mut first_failure: Option<i32> = None;
        let mut omitted = 0;

        for set in &ctx.policy_sets {
            let args = vec![
                "test".to_string(),
                "--no-color".to_string(),
                "--policy".to_string(),
                set.path.clone(),
                show_file.to_string_lossy().into_owned(),
            ];
            let out = match self.exec(program, &args, &dir, &BTreeMap::new(), None).await {
                Ok(out) => out,
                Err(e) => return Self::spawn_failed(label, program, &e, started).into(),
            };
            omitted += out.omitted;
            if !out.success && first_failure.is_none() {
                first_failure = Some(out.exit_code);
            }
            output.push_str(&format!(
                "policy set {}: {}\n",
                set.name,
                if out.success { "passed" } else { "failed" }
            ));
            output.push_str(&out.combined());
            if !output.ends_with('\n') {
                output.push('\n');
            }
            // A fresh check clears earlier approvals.
            statuses.push(PolicySetStatus {
                name: set.name.clone(),
                passed: out.success,
                approvals: 0,
                approvals_required: set.approvals_required,
            });
        }

        let result = StepResult {
            step: label.to_string(),
            status: if first_failure.is_none() {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            },
            exit_code: Some(first_failure.unwrap_or(0)),
            output: cap_output(output, self.config.output_limit_bytes, omitted),
            duration_ms: elapsed_ms(started),
            best_effort: false,
            fault: None,
        };
        StepOutcome {
            result,
            exported: None,
            policy_status: Some(statuses),
        }
    }
}

#[async_trait]
impl StepExecutor for ProcessStepExecutor {
    async fn run(
        &self,
        step: &Step,
        ctx: &ProjectContext,
        env: &BTreeMap<String, String>,
    ) -> StepOutcome {
        let started = Instant::now();
        let label = step.label();

        if let StepKind::ApprovePolicies = step.kind {
            let (result, status) = approve_policies(ctx, &label);
            return StepOutcome {
                result,
                exported: None,
                policy_status: Some(status),
            };
        }

        let dir = ctx.project_dir();
        if !dir.is_dir() {
            return StepResult::errored(
                &label,
                StepFault::Environment {
                    reason: format!("working directory {} is not accessible", dir.display()),
                },
                elapsed_ms(started),
            )
            .into();
        }

        if let Some(args) = tool_args(step, ctx) {
            return self.run_tool(step, ctx, env, args, &label, started).await;
        }

        match &step.kind {
            StepKind::PolicyCheck => self.run_policy_check(ctx, &label, started).await,
            StepKind::Run { command } => {
                match self.run_shell(command, step, ctx, env, started).await {
                    Ok(out) => self.finished(&label, &out, out.combined(), started).into(),
                    Err(result) => result.into(),
                }
            }
            StepKind::Env {
                name,
                value: Some(value),
                ..
            } => StepOutcome {
                result: StepResult::succeeded(&label, String::new(), elapsed_ms(started)),
                exported: Some((name.clone(), value.clone())),
                policy_status: None,
            },
            StepKind::Env {
                name,
                command: Some(command),
                ..
            } => match self.run_shell(command, step, ctx, env, started).await {
                Ok(out) => {
                    let exported = out
                        .success
                        .then(|| (name.clone(), out.stdout.trim().to_string()));
                    StepOutcome {
                        result: self.finished(&label, &out, out.combined(), started),
                        exported,
                        policy_status: None,
                    }
                }
                Err(result) => result.into(),
            },
            other => StepResult::errored(
                &label,
                StepFault::Environment {
                    reason: format!("step {} cannot be executed as defined", other.name()),
                },
                elapsed_ms(started),
            )
            .into(),
        }
    }
}
