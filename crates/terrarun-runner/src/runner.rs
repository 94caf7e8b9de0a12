//! Project command orchestration.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use terrarun_core::obs;
use terrarun_core::{
    CommandKind, FailureCause, PlanSummary, PolicySetStatus, ProjectContext, ProjectResult,
    RepoConfigProvider, RunnerConfig, Step, StepFault, StepKind, StepResult, StepStatus,
};
use terrarun_locking::{LockGuard, LockHolder, ProjectLocker};
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use crate::executor::{ProcessStepExecutor, StepExecutor, StepOutcome};
use crate::resolver::WorkflowResolver;

/// What an invocation accumulated so far.
#[derive(Debug, Default)]
struct PipelineRun {
    steps: Vec<StepResult>,
    cause: Option<FailureCause>,
    plan_summary: Option<PlanSummary>,
    policy_status: Vec<PolicySetStatus>,
}

impl PipelineRun {
    fn failed(cause: FailureCause) -> Self {
        Self {
            cause: Some(cause),
            ..Self::default()
        }
    }
}

/// Runs project commands: resolves the workflow, takes the project lock,
/// executes the steps in order and reports one [`ProjectResult`].
///
/// Share one runner (and so one lock table) across every concurrent
/// invocation in the process.
pub struct ProjectCommandRunner {
    config: RunnerConfig,
    locker: Arc<ProjectLocker>,
    repo_configs: Arc<dyn RepoConfigProvider>,
    executor: Arc<dyn StepExecutor>,
}

impl ProjectCommandRunner {
    pub fn new(
        config: RunnerConfig,
        locker: Arc<ProjectLocker>,
        repo_configs: Arc<dyn RepoConfigProvider>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            config,
            locker,
            repo_configs,
            executor,
        }
    }

    /// Runner that executes steps as child processes.
    pub fn with_process_executor(
        config: RunnerConfig,
        locker: Arc<ProjectLocker>,
        repo_configs: Arc<dyn RepoConfigProvider>,
    ) -> Self {
        let executor = Arc::new(ProcessStepExecutor::new(config.clone()));
        Self::new(config, locker, repo_configs, executor)
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn locker(&self) -> &Arc<ProjectLocker> {
        &self.locker
    }

    pub async fn plan(&self, ctx: &ProjectContext) -> ProjectResult {
        self.execute(CommandKind::Plan, ctx).await
    }

    pub async fn apply(&self, ctx: &ProjectContext) -> ProjectResult {
        self.execute(CommandKind::Apply, ctx).await
    }

    pub async fn approve_policies(&self, ctx: &ProjectContext) -> ProjectResult {
        self.execute(CommandKind::ApprovePolicies, ctx).await
    }

    pub async fn import(&self, ctx: &ProjectContext) -> ProjectResult {
        self.execute(CommandKind::Import, ctx).await
    }

    pub async fn policy_check(&self, ctx: &ProjectContext) -> ProjectResult {
        self.execute(CommandKind::PolicyCheck, ctx).await
    }

    pub async fn state_rm(&self, ctx: &ProjectContext) -> ProjectResult {
        self.execute(CommandKind::StateRm, ctx).await
    }

    pub async fn version(&self, ctx: &ProjectContext) -> ProjectResult {
        self.execute(CommandKind::Version, ctx).await
    }

    /// Run `kind` against the project described by `ctx`.
    ///
    /// Expected failures (contention, failing steps, bad configuration,
    /// cancellation) are reported in the result, never as a panic or error.
    pub async fn execute(&self, kind: CommandKind, ctx: &ProjectContext) -> ProjectResult {
        let invocation_id = Uuid::new_v4();
        let span = obs::invocation_span(&invocation_id.to_string(), kind, &ctx.lock_key());
        self.execute_inner(kind, ctx, invocation_id)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        kind: CommandKind,
        ctx: &ProjectContext,
        invocation_id: Uuid,
    ) -> ProjectResult {
        let started = Instant::now();
        // Steps see the command actually being run.
        let ctx: Cow<'_, ProjectContext> = if ctx.command == kind {
            Cow::Borrowed(ctx)
        } else {
            Cow::Owned(ctx.clone().with_command(kind))
        };
        let ctx = &*ctx;

        let repo = self
            .repo_configs
            .repo_config(&ctx.repo_full_name, &ctx.repo_rel_dir);
        let workflow = match WorkflowResolver::resolve(kind, &ctx.workflow, repo.as_deref()) {
            Ok(workflow) => workflow,
            Err(e) => {
                obs::emit_configuration_error(&e);
                let run = PipelineRun::failed(FailureCause::Configuration {
                    message: e.to_string(),
                });
                return self.finish(kind, ctx, invocation_id, &ctx.workflow, run, started);
            }
        };

        if ctx.cancel.is_cancelled() {
            let run = PipelineRun::failed(FailureCause::Cancelled { step: None });
            return self.finish(kind, ctx, invocation_id, &workflow.name, run, started);
        }

        let guard = match self.acquire(kind, ctx, invocation_id) {
            Ok(guard) => guard,
            Err(cause) => {
                let run = PipelineRun::failed(cause);
                return self.finish(kind, ctx, invocation_id, &workflow.name, run, started);
            }
        };

        obs::emit_project_started(&workflow.name, &workflow.digest(), workflow.steps.len());
        let run = self.run_steps(&workflow.steps, ctx, started).await;

        if let Some(guard) = guard {
            // Failures are logged by the lock table.
            let _ = guard.release();
        }
        self.finish(kind, ctx, invocation_id, &workflow.name, run, started)
    }

    /// Take the lock `kind` needs, if any.
    fn acquire(
        &self,
        kind: CommandKind,
        ctx: &ProjectContext,
        invocation_id: Uuid,
    ) -> Result<Option<LockGuard>, FailureCause> {
        let Some(domain) = kind.lock_domain() else {
            debug!(command = %kind, "command runs without a lock");
            return Ok(None);
        };
        let holder = LockHolder::new(invocation_id, kind).with_pull(ctx.pull_num, ctx.user.clone());
        match self.locker.try_lock(ctx.lock_key(), domain, holder) {
            Ok(guard) => Ok(Some(guard)),
            Err(contention) => {
                obs::emit_lock_contended(&contention.key, &contention.holder.invocation_id);
                Err(FailureCause::Contention {
                    holder: contention.holder.invocation_id,
                    holder_command: contention.holder.command,
                    held_since: contention.holder.acquired_at,
                })
            }
        }
    }

    async fn run_steps(&self, steps: &[Step], ctx: &ProjectContext, started: Instant) -> PipelineRun {
        let deadline = self
            .config
            .pipeline_timeout_secs
            .map(|secs| started + Duration::from_secs(secs));
        let mut run = PipelineRun::default();
        let mut env = BTreeMap::new();

        for (seq, step) in steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(next = %step.label(), "cancelled between steps");
                run.cause = Some(FailureCause::Cancelled { step: None });
                break;
            }
            let (outcome, hard_stop) = self.run_step(step, ctx, &env, deadline).await;
            let mut result = outcome.result;
            result.best_effort = step.best_effort;
            obs::emit_step_finished(seq + 1, &result);

            if result.passed() {
                if let Some((name, value)) = outcome.exported {
                    env.insert(name, value);
                }
                if step.kind == StepKind::Plan {
                    run.plan_summary = PlanSummary::parse(&result.output).or(run.plan_summary);
                }
            }
            if let Some(status) = outcome.policy_status {
                run.policy_status = status;
            }

            let stop = hard_stop || result.aborts_pipeline();
            if stop {
                info!(step = %result.step, status = %result.status, "aborting pipeline");
                run.cause = Some(FailureCause::from_step(&result));
            }
            run.steps.push(result);
            if stop {
                break;
            }
        }
        run
    }

    /// Run one step under its timeout and the invocation's cancellation.
    ///
    /// Losing the race drops the executor future, which kills any child
    /// process it spawned. The flag is set when the whole pipeline must stop
    /// regardless of the step being best-effort.
    async fn run_step(
        &self,
        step: &Step,
        ctx: &ProjectContext,
        env: &BTreeMap<String, String>,
        deadline: Option<Instant>,
    ) -> (StepOutcome, bool) {
        let started = Instant::now();
        let step_limit = step.timeout_secs.or(self.config.step_timeout_secs);
        let pipeline_left = deadline.map(|d| d.saturating_duration_since(started));

        let (limit, pipeline_bound) = match (step_limit.map(Duration::from_secs), pipeline_left) {
            (Some(s), Some(p)) if p < s => (Some(p), true),
            (Some(s), _) => (Some(s), false),
            (None, Some(p)) => (Some(p), true),
            (None, None) => (None, false),
        };
        let timer = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Cancellation is checked first so a raised signal always wins over
        // an executor that is ready on the same poll.
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                info!(step = %step.label(), "step cancelled");
                let result = StepResult::errored(
                    step.label(),
                    StepFault::Cancelled,
                    started.elapsed().as_millis() as u64,
                );
                (result.into(), true)
            }
            outcome = self.executor.run(step, ctx, env) => (outcome, false),
            _ = timer => {
                let limit_secs = if pipeline_bound {
                    self.config.pipeline_timeout_secs.unwrap_or_default()
                } else {
                    step_limit.unwrap_or_default()
                };
                info!(step = %step.label(), limit_secs, pipeline = pipeline_bound, "step timed out");
                let result = StepResult {
                    step: step.label(),
                    status: StepStatus::Failed,
                    exit_code: None,
                    output: format!("timed out after {limit_secs}s"),
                    duration_ms: started.elapsed().as_millis() as u64,
                    best_effort: false,
                    fault: Some(StepFault::Timeout { limit_secs }),
                };
                (result.into(), pipeline_bound)
            }
        }
    }

    fn finish(
        &self,
        kind: CommandKind,
        ctx: &ProjectContext,
        invocation_id: Uuid,
        workflow: &str,
        run: PipelineRun,
        started: Instant,
    ) -> ProjectResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        let result = ProjectResult::new(
            ctx,
            kind,
            invocation_id,
            workflow,
            run.steps,
            run.cause,
            duration_ms,
        )
        .with_plan_summary(run.plan_summary)
        .with_policy_status(run.policy_status);
        obs::emit_project_finished(result.status, result.steps.len(), duration_ms);
        result
    }
}
