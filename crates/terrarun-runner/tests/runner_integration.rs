//! Integration tests for the project command runner with real processes.
//!
//! The infrastructure tool is `sh`: a built-in step such as
//! `sh plan -input=false ...` runs the script named `plan` in the project
//! directory, so each test scripts the tool per subcommand.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use terrarun_core::{
    cancel_pair, CommandKind, FailureCause, PolicySet, ProjectContext, ProjectStatus, RepoConfig,
    RunnerConfig, StaticRepoConfig, Step, StepFault, StepStatus, WorkflowDef,
};
use terrarun_locking::ProjectLocker;
use terrarun_runner::ProjectCommandRunner;

fn script(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).expect("write script");
}

fn config() -> RunnerConfig {
    RunnerConfig {
        tool_binary: "sh".to_string(),
        policy_binary: "sh".to_string(),
        ..RunnerConfig::default()
    }
}

fn runner_with(config: RunnerConfig, repo: Option<RepoConfig>) -> ProjectCommandRunner {
    let provider = match repo {
        Some(repo) => StaticRepoConfig::new(repo),
        None => StaticRepoConfig::empty(),
    };
    ProjectCommandRunner::with_process_executor(
        config,
        Arc::new(ProjectLocker::new()),
        Arc::new(provider),
    )
}

fn runner() -> ProjectCommandRunner {
    runner_with(config(), None)
}

fn custom_plan(steps: Vec<Step>) -> RepoConfig {
    RepoConfig::default().with_workflow(
        "custom",
        WorkflowDef {
            plan: Some(steps),
            ..Default::default()
        },
    )
}

fn ctx(repo: &Path, kind: CommandKind) -> ProjectContext {
    ProjectContext::new("acme/infra", repo, kind)
        .with_dir("envs/prod")
        .with_pull(12, "bob")
        .with_user("alice")
}

fn project_dir(repo: &Path) -> std::path::PathBuf {
    let dir = repo.join("envs/prod");
    std::fs::create_dir_all(&dir).expect("create project dir");
    dir
}

/// Test: init and plan both succeed (default workflow)
#[tokio::test]
async fn test_plan_success() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "init", "echo 'Terraform has been successfully initialized!'\n");
    script(
        &dir,
        "plan",
        "touch \"$4\"\necho 'Plan: 2 to add, 0 to change, 1 to destroy.'\n",
    );

    let runner = runner();
    let result = runner.plan(&ctx(repo.path(), CommandKind::Plan)).await;

    assert_eq!(result.status, ProjectStatus::Success, "{}", result.output);
    assert_eq!(result.steps.len(), 2);
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    assert_eq!(result.steps[0].step, "init");
    assert_eq!(result.steps[1].step, "plan");
    let summary = result.plan_summary.expect("plan summary");
    assert_eq!((summary.add, summary.change, summary.destroy), (2, 0, 1));
    assert!(dir.join("default.tfplan").exists(), "plan file written");
    assert!(result.output.contains("plan: 2 to add, 0 to change, 1 to destroy."));
    assert!(runner.locker().is_empty());
}

/// Test: init fails, plan is never attempted
#[tokio::test]
async fn test_plan_init_failure_is_fail_fast() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "init", "echo 'backend unreachable' >&2\nexit 1\n");
    script(&dir, "plan", "touch plan-ran\n");

    let runner = runner();
    let result = runner.plan(&ctx(repo.path(), CommandKind::Plan)).await;

    assert_eq!(result.status, ProjectStatus::Failure);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].status, StepStatus::Failed);
    assert_eq!(result.steps[0].exit_code, Some(1));
    assert!(result.steps[0].output.contains("backend unreachable"));
    assert!(!dir.join("plan-ran").exists(), "plan must not run");
    assert!(matches!(
        result.cause,
        Some(FailureCause::StepFailed { ref step, exit_code: Some(1), .. }) if step == "init"
    ));
    assert!(runner.locker().is_empty());
}

/// Test: unknown workflow yields a configuration error before anything runs
#[tokio::test]
async fn test_unknown_workflow() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "init", "touch init-ran\n");

    let result = runner()
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workflow("nonexistent"))
        .await;

    assert_eq!(result.status, ProjectStatus::Error);
    assert!(result.steps.is_empty());
    assert!(result.output.contains("nonexistent"));
    assert!(matches!(result.cause, Some(FailureCause::Configuration { .. })));
    assert!(!dir.join("init-ran").exists());
}

/// Test: steps run in declared order and stop at the first failure
#[tokio::test]
async fn test_custom_workflow_order_and_fail_fast() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    let steps = vec![
        Step::run("echo one >> order.log"),
        Step::run("echo two >> order.log; exit 4"),
        Step::run("echo three >> order.log"),
    ];
    let runner = runner_with(config(), Some(custom_plan(steps)));

    let result = runner
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workflow("custom"))
        .await;

    assert_eq!(result.status, ProjectStatus::Failure);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[1].exit_code, Some(4));
    let log = std::fs::read_to_string(dir.join("order.log")).unwrap();
    assert_eq!(log, "one\ntwo\n");
    assert_eq!(result.workflow, "custom");
}

/// Test: a failing best-effort step is recorded and the pipeline continues
#[tokio::test]
async fn test_best_effort_step() {
    let repo = tempfile::tempdir().unwrap();
    project_dir(repo.path());
    let steps = vec![Step::run("exit 2").best_effort(), Step::run("echo after")];
    let runner = runner_with(config(), Some(custom_plan(steps)));

    let result = runner
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workflow("custom"))
        .await;

    assert_eq!(result.status, ProjectStatus::Success, "{}", result.output);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[0].status, StepStatus::Failed);
    assert!(result.steps[0].best_effort);
    assert_eq!(result.steps[1].output.trim(), "after");
    assert!(result.output.contains("best effort"));
}

/// Test: env steps feed later steps, alongside the standard environment
#[tokio::test]
async fn test_env_step_reaches_later_steps() {
    let repo = tempfile::tempdir().unwrap();
    project_dir(repo.path());
    let steps = vec![
        Step::env_value("REGION", "eu-west-1"),
        Step::env_command("STAGE", "echo \"  ${REGION}-prod  \""),
        Step::run("echo \"$STAGE $USER_NAME $PULL_NUM $BASE_REPO_OWNER $COMMAND_NAME\""),
    ];
    let runner = runner_with(config(), Some(custom_plan(steps)));

    let result = runner
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workflow("custom"))
        .await;

    assert_eq!(result.status, ProjectStatus::Success, "{}", result.output);
    assert_eq!(result.steps[0].step, "env:REGION");
    assert_eq!(
        result.steps[2].output.trim(),
        "eu-west-1-prod alice 12 acme plan"
    );
}

/// Test: oversized output is truncated with a marker
#[tokio::test]
async fn test_output_truncated() {
    let repo = tempfile::tempdir().unwrap();
    project_dir(repo.path());
    let steps = vec![Step::run("i=0; while [ $i -lt 100 ]; do printf x; i=$((i+1)); done")];
    let config = RunnerConfig {
        output_limit_bytes: 16,
        ..config()
    };
    let runner = runner_with(config, Some(custom_plan(steps)));

    let result = runner
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workflow("custom"))
        .await;

    assert!(result.is_success());
    assert_eq!(
        result.steps[0].output,
        format!("{}\n... [output truncated: 84 bytes omitted]", "x".repeat(16))
    );
}

/// Test: a step exceeding its timeout is killed and fails the pipeline
#[tokio::test]
async fn test_step_timeout_kills_process() {
    let repo = tempfile::tempdir().unwrap();
    project_dir(repo.path());
    let steps = vec![Step::run("sleep 30").with_timeout_secs(1), Step::run("echo never")];
    let runner = runner_with(config(), Some(custom_plan(steps)));

    let started = Instant::now();
    let result = runner
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workflow("custom"))
        .await;

    assert!(started.elapsed().as_secs() < 10, "timeout not enforced");
    assert_eq!(result.status, ProjectStatus::Failure);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].fault, Some(StepFault::Timeout { limit_secs: 1 }));
    assert!(result.output.contains("timed out after 1s"));
    assert!(runner.locker().is_empty());
}

/// Test: a timed-out step takes its descendants down with it
#[cfg(unix)]
#[tokio::test]
async fn test_step_timeout_kills_descendants() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    // The inner `sh` is a grandchild of the step process.
    let steps = vec![Step::run("sh -c 'sleep 2; touch still-mutating' | cat").with_timeout_secs(1)];
    let runner = runner_with(config(), Some(custom_plan(steps)));

    let result = runner
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workflow("custom"))
        .await;
    assert_eq!(result.steps[0].fault, Some(StepFault::Timeout { limit_secs: 1 }));
    assert!(runner.locker().is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!dir.join("still-mutating").exists(), "descendant outlived the step");
}

/// Test: cancelling a running step kills its background children too
#[cfg(unix)]
#[tokio::test]
async fn test_cancellation_kills_descendants() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    let steps = vec![Step::run("(sleep 1; touch cancelled-late) & wait")];
    let runner = runner_with(config(), Some(custom_plan(steps)));
    let (handle, signal) = cancel_pair();
    let context = ctx(repo.path(), CommandKind::Plan)
        .with_workflow("custom")
        .with_cancel(signal);

    let (result, ()) = tokio::join!(runner.plan(&context), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();
    });
    assert_eq!(result.status, ProjectStatus::Error);
    assert_eq!(result.steps[0].fault, Some(StepFault::Cancelled));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!dir.join("cancelled-late").exists(), "descendant outlived the step");
}

/// Test: the pipeline timeout stops even a best-effort step
#[tokio::test]
async fn test_pipeline_timeout() {
    let repo = tempfile::tempdir().unwrap();
    project_dir(repo.path());
    let steps = vec![Step::run("sleep 30").best_effort(), Step::run("echo never")];
    let config = RunnerConfig {
        pipeline_timeout_secs: Some(1),
        ..config()
    };
    let runner = runner_with(config, Some(custom_plan(steps)));

    let result = runner
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workflow("custom"))
        .await;

    assert_eq!(result.status, ProjectStatus::Failure);
    assert_eq!(result.steps.len(), 1);
    assert!(matches!(
        result.cause,
        Some(FailureCause::Timeout { limit_secs: 1, .. })
    ));
}

/// Test: a missing tool binary is an environment error
#[tokio::test]
async fn test_missing_binary() {
    let repo = tempfile::tempdir().unwrap();
    project_dir(repo.path());
    let config = RunnerConfig {
        tool_binary: "terrarun-test-no-such-tool".to_string(),
        ..config()
    };

    let result = runner_with(config, None)
        .version(&ctx(repo.path(), CommandKind::Version))
        .await;

    assert_eq!(result.status, ProjectStatus::Error);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].status, StepStatus::Errored);
    assert!(matches!(result.cause, Some(FailureCause::Environment { .. })));
}

/// Test: a missing project directory is an environment error
#[tokio::test]
async fn test_missing_directory() {
    let repo = tempfile::tempdir().unwrap();
    let runner = runner();

    let result = runner
        .plan(&ctx(repo.path(), CommandKind::Plan).with_dir("does/not/exist"))
        .await;

    assert_eq!(result.status, ProjectStatus::Error);
    assert_eq!(result.steps.len(), 1);
    assert!(result.output.contains("not accessible"));
    assert!(runner.locker().is_empty());
}

/// Test: version is repeatable and structurally identical
#[tokio::test]
async fn test_version_idempotent() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "version", "echo 'Terraform v1.6.0'\n");

    let runner = runner();
    let context = ctx(repo.path(), CommandKind::Version);
    let first = runner.version(&context).await;
    let second = runner.version(&context).await;

    assert!(first.is_success());
    assert_eq!(first.status, second.status);
    assert_eq!(first.steps.len(), second.steps.len());
    for (a, b) in first.steps.iter().zip(&second.steps) {
        assert_eq!(
            (&a.step, a.status, a.exit_code, &a.output),
            (&b.step, b.status, b.exit_code, &b.output)
        );
    }
    assert_eq!(first.steps[0].output.trim(), "Terraform v1.6.0");
}

/// Test: apply consumes the plan file and refuses to run without one
#[tokio::test]
async fn test_apply_consumes_plan() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "apply", "echo \"applying $2\"\necho 'Apply complete!'\n");

    let runner = runner();
    let context = ctx(repo.path(), CommandKind::Apply);

    let missing = runner.apply(&context).await;
    assert_eq!(missing.status, ProjectStatus::Failure);
    assert!(missing.output.contains("no plan found"));

    std::fs::write(dir.join("default.tfplan"), b"saved plan").unwrap();
    let applied = runner.apply(&context).await;
    assert!(applied.is_success(), "{}", applied.output);
    assert!(applied.steps[0].output.contains("applying default.tfplan"));
    assert!(!dir.join("default.tfplan").exists(), "plan file removed");
}

/// Test: import runs init then import with the user's arguments
#[tokio::test]
async fn test_import_default_workflow() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "init", "echo \"init $*\"\n");
    script(&dir, "import", "echo \"import $*\"\n");

    let runner = runner();
    let context = ctx(repo.path(), CommandKind::Import).with_extra_args(["aws_instance.web", "i-0abc"]);
    std::fs::write(context.plan_file(), b"saved plan").unwrap();
    std::fs::write(context.show_file(), b"{}").unwrap();

    let result = runner.import(&context).await;

    assert!(result.is_success(), "{}", result.output);
    assert_eq!(result.command, CommandKind::Import);
    let labels: Vec<_> = result.steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(labels, ["init", "import"]);
    // Extra args go to import only.
    assert_eq!(result.steps[0].output.trim(), "init -input=false");
    assert_eq!(
        result.steps[1].output.trim(),
        "import -input=false aws_instance.web i-0abc"
    );
    assert!(!context.plan_file().exists(), "stale plan removed");
    assert!(!context.show_file().exists(), "stale plan JSON removed");
    assert!(runner.locker().is_empty());
}

/// Test: a failed import leaves the saved plan alone
#[tokio::test]
async fn test_failed_import_keeps_plan() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "init", "true\n");
    script(&dir, "import", "echo 'resource not found' >&2\nexit 1\n");

    let context = ctx(repo.path(), CommandKind::Import).with_extra_args(["aws_instance.web", "i-0abc"]);
    std::fs::write(context.plan_file(), b"saved plan").unwrap();

    let result = runner().import(&context).await;

    assert_eq!(result.status, ProjectStatus::Failure);
    assert_eq!(result.steps[1].exit_code, Some(1));
    assert!(result.steps[1].output.contains("resource not found"));
    assert!(context.plan_file().exists());
}

/// Test: state rm runs init then `state rm` with the addresses to forget
#[tokio::test]
async fn test_state_rm_default_workflow() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "init", "true\n");
    // `sh state rm ...` runs the `state` script with `rm` as $1.
    script(&dir, "state", "echo \"state $*\"\n");

    let runner = runner();
    let context = ctx(repo.path(), CommandKind::StateRm)
        .with_workspace("staging")
        .with_extra_args(["aws_instance.web", "aws_eip.web"]);
    std::fs::write(context.plan_file(), b"saved plan").unwrap();

    let result = runner.state_rm(&context).await;

    assert!(result.is_success(), "{}", result.output);
    assert_eq!(result.command, CommandKind::StateRm);
    let labels: Vec<_> = result.steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(labels, ["init", "state_rm"]);
    assert_eq!(
        result.steps[1].output.trim(),
        "state rm aws_instance.web aws_eip.web"
    );
    assert!(!context.plan_file().exists(), "stale plan removed");
    assert!(runner.locker().is_empty());
}

/// Test: non-default workspaces are selected through the environment
#[tokio::test]
async fn test_workspace_exported_to_tool() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "init", "echo \"ws=$TF_WORKSPACE auto=$TF_IN_AUTOMATION\"\n");
    script(&dir, "plan", "touch \"$4\"\necho \"planfile=$4\"\n");

    let result = runner()
        .plan(&ctx(repo.path(), CommandKind::Plan).with_workspace("staging"))
        .await;

    assert!(result.is_success(), "{}", result.output);
    assert_eq!(result.steps[0].output.trim(), "ws=staging auto=true");
    assert_eq!(result.steps[1].output.trim(), "planfile=staging.tfplan");
    assert!(result.output.contains("acme/infra envs/prod/staging: success"));
}

/// Test: policy check reports per-set outcomes and approval clears them
#[tokio::test]
async fn test_policy_check_then_approve() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    std::fs::write(dir.join("default.tfplan"), b"saved plan").unwrap();
    script(&dir, "show", "echo '{\"resource_changes\":[]}'\n");
    // `sh test --no-color --policy <path> <showfile>`
    script(
        &dir,
        "test",
        "case \"$3\" in *deny*) echo \"FAIL - $4\"; exit 1;; *) echo \"PASS - $4\";; esac\n",
    );

    let runner = runner();
    let context = ctx(repo.path(), CommandKind::PolicyCheck)
        .with_policy_set(PolicySet::new("cost", "policies/cost").with_owner("carol"))
        .with_policy_set(PolicySet::new("security", "policies/deny").with_owner("alice"));

    let checked = runner.policy_check(&context).await;
    assert_eq!(checked.status, ProjectStatus::Failure);
    assert_eq!(checked.steps.len(), 2);
    assert!(dir.join("default.tfplan.json").exists(), "show output saved");
    let status = checked.policy_status.clone();
    assert_eq!(status.len(), 2);
    assert!(status[0].passed);
    assert!(!status[1].passed);
    assert!(checked.output.contains("policy security: failed, 0/1 approvals"));

    let approved = runner
        .approve_policies(&context.clone().with_policy_status(status))
        .await;
    assert!(approved.is_success(), "{}", approved.output);
    assert_eq!(approved.policy_status[1].approvals, 1);
    assert!(approved.policy_status.iter().all(|s| s.is_satisfied()));
}

/// Test: results serialize for machine consumers
#[tokio::test]
async fn test_result_json() {
    let repo = tempfile::tempdir().unwrap();
    let dir = project_dir(repo.path());
    script(&dir, "version", "echo v1\n");

    let result = runner()
        .version(&ctx(repo.path(), CommandKind::Version))
        .await;
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["command"], "version");
    assert_eq!(json["steps"][0]["step"], "version");
    assert_eq!(json["steps"][0]["exit_code"], 0);
}
