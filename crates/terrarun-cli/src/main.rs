//! terrarun - run infrastructure-as-code commands for one project
//!
//! ## Commands
//!
//! - `plan`, `apply`, `import`, `state-rm`: locked, mutating commands
//! - `policy-check`: evaluate policy sets against the saved plan
//! - `approve-policies`: approve failing policy sets you own
//! - `version`: print the tool version
//!
//! Everything after `--` is passed to the tool as extra arguments.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use terrarun_core::{
    cancel_pair, CommandKind, LogFormat, PolicySet, PolicySetStatus, ProjectContext, ProjectResult,
    ProjectStatus, RepoConfig, RunnerConfig, StaticRepoConfig,
};
use terrarun_locking::ProjectLocker;
use terrarun_runner::ProjectCommandRunner;
use tracing::{debug, info, Level};

#[derive(Parser)]
#[command(name = "terrarun")]
#[command(author = "Stevedores Org")]
#[command(version = terrarun_core::VERSION)]
#[command(about = "Pull-request driven infrastructure-as-code runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format on stderr: text or json
    #[arg(long, global = true, env = "TERRARUN_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize and plan the project
    Plan(ProjectArgs),
    /// Apply the saved plan
    Apply(ProjectArgs),
    /// Approve failing policy sets owned by --user
    ApprovePolicies(ProjectArgs),
    /// Import an existing resource into state
    Import(ProjectArgs),
    /// Check the saved plan against the configured policy sets
    PolicyCheck(ProjectArgs),
    /// Remove resources from state
    StateRm(ProjectArgs),
    /// Print the tool version
    Version(ProjectArgs),
}

impl Commands {
    fn split(self) -> (CommandKind, ProjectArgs) {
        match self {
            Commands::Plan(args) => (CommandKind::Plan, args),
            Commands::Apply(args) => (CommandKind::Apply, args),
            Commands::ApprovePolicies(args) => (CommandKind::ApprovePolicies, args),
            Commands::Import(args) => (CommandKind::Import, args),
            Commands::PolicyCheck(args) => (CommandKind::PolicyCheck, args),
            Commands::StateRm(args) => (CommandKind::StateRm, args),
            Commands::Version(args) => (CommandKind::Version, args),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ProjectArgs {
    /// Repository full name, owner/name
    #[arg(long, env = "TERRARUN_REPO")]
    repo: String,

    /// Checkout of the repository
    #[arg(long, env = "TERRARUN_REPO_DIR", default_value = ".")]
    repo_dir: PathBuf,

    /// Project directory relative to the checkout
    #[arg(short, long, env = "TERRARUN_DIR", default_value = ".")]
    dir: String,

    /// Workspace to run in
    #[arg(short, long, env = "TERRARUN_WORKSPACE", default_value = "default")]
    workspace: String,

    /// Project name, used in plan file names
    #[arg(short, long, env = "TERRARUN_PROJECT")]
    project: Option<String>,

    /// Named workflow from the repository configuration
    #[arg(long, env = "TERRARUN_WORKFLOW", default_value = "default")]
    workflow: String,

    /// User issuing the command
    #[arg(short, long, env = "TERRARUN_USER", default_value = "")]
    user: String,

    /// Pull request number
    #[arg(long, env = "TERRARUN_PULL_NUM", default_value_t = 0)]
    pull_num: u64,

    /// Pull request author
    #[arg(long, env = "TERRARUN_PULL_AUTHOR", default_value = "")]
    pull_author: String,

    #[arg(long, env = "TERRARUN_BASE_BRANCH", default_value = "")]
    base_branch: String,

    #[arg(long, env = "TERRARUN_HEAD_BRANCH", default_value = "")]
    head_branch: String,

    #[arg(long, env = "TERRARUN_BASE_COMMIT", default_value = "")]
    base_commit: String,

    #[arg(long, env = "TERRARUN_HEAD_COMMIT", default_value = "")]
    head_commit: String,

    /// Policy set as NAME=PATH, repeatable
    #[arg(long = "policy-set", value_name = "NAME=PATH")]
    policy_sets: Vec<String>,

    /// Owner allowed to approve every policy set, repeatable
    #[arg(long = "policy-owner", value_name = "USER")]
    policy_owners: Vec<String>,

    /// Approvals required per failing policy set
    #[arg(long, default_value_t = 1)]
    approvals_required: u32,

    /// JSON file with policy outcomes from an earlier policy-check
    #[arg(long, value_name = "FILE")]
    policy_status: Option<PathBuf>,

    /// Repository configuration (TOML) defining named workflows
    #[arg(long, env = "TERRARUN_REPO_CONFIG")]
    repo_config: Option<PathBuf>,

    /// Runner configuration (TOML)
    #[arg(long, env = "TERRARUN_RUNNER_CONFIG")]
    runner_config: Option<PathBuf>,

    /// Print the result as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Extra arguments for the tool
    #[arg(last = true)]
    extra_args: Vec<String>,
}

/// Parse `NAME=PATH`.
fn parse_policy_set(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, path)) if !name.trim().is_empty() && !path.trim().is_empty() => {
            Ok((name.trim().to_string(), path.trim().to_string()))
        }
        _ => bail!("invalid policy set {raw:?}, expected NAME=PATH"),
    }
}

fn load_policy_status(path: &Path) -> Result<Vec<PolicySetStatus>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy status from {}", path.display()))?;
    // Accept either the bare list or a whole serialized result.
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let list = match value.get("policy_status") {
        Some(inner) => inner.clone(),
        None => value,
    };
    serde_json::from_value(list)
        .with_context(|| format!("Failed to parse policy status in {}", path.display()))
}

fn build_context(kind: CommandKind, args: &ProjectArgs) -> Result<ProjectContext> {
    let mut ctx = ProjectContext::new(&args.repo, &args.repo_dir, kind)
        .with_dir(&args.dir)
        .with_workspace(&args.workspace)
        .with_workflow(&args.workflow)
        .with_user(&args.user)
        .with_pull(args.pull_num, &args.pull_author)
        .with_branches(&args.base_branch, &args.head_branch)
        .with_commits(&args.base_commit, &args.head_commit)
        .with_extra_args(args.extra_args.iter().cloned());
    if let Some(name) = &args.project {
        ctx = ctx.with_project_name(name);
    }

    for raw in &args.policy_sets {
        let (name, path) = parse_policy_set(raw)?;
        let mut set = PolicySet::new(name, path);
        set.approvals_required = args.approvals_required;
        for owner in &args.policy_owners {
            set = set.with_owner(owner);
        }
        ctx = ctx.with_policy_set(set);
    }

    if let Some(path) = &args.policy_status {
        ctx = ctx.with_policy_status(load_policy_status(path)?);
    }
    Ok(ctx)
}

fn load_configs(args: &ProjectArgs) -> Result<(RunnerConfig, StaticRepoConfig)> {
    let runner = match &args.runner_config {
        Some(path) => RunnerConfig::load(path)
            .with_context(|| format!("Failed to load runner config {}", path.display()))?,
        None => RunnerConfig::default(),
    };
    let repo = match &args.repo_config {
        Some(path) => StaticRepoConfig::new(
            RepoConfig::load(path)
                .with_context(|| format!("Failed to load repo config {}", path.display()))?,
        ),
        None => StaticRepoConfig::empty(),
    };
    Ok((runner, repo))
}

fn exit_code(result: &ProjectResult) -> ExitCode {
    match result.status {
        ProjectStatus::Success => ExitCode::SUCCESS,
        ProjectStatus::Failure => ExitCode::from(1),
        ProjectStatus::Error => ExitCode::from(2),
    }
}

async fn cmd_run(kind: CommandKind, args: ProjectArgs) -> Result<ExitCode> {
    let (runner_config, repo_config) = load_configs(&args)?;
    let (cancel, signal) = cancel_pair();
    let ctx = build_context(kind, &args)?.with_cancel(signal);
    debug!(project = %ctx.display_name(), command = %kind, "context built");

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let runner = ProjectCommandRunner::with_process_executor(
        runner_config,
        Arc::new(ProjectLocker::new()),
        Arc::new(repo_config),
    );
    let result = runner.execute(kind, &ctx).await;

    if args.json {
        let rendered =
            serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        println!("{rendered}");
    } else {
        print!("{}", result.output);
    }
    Ok(exit_code(&result))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    terrarun_core::init_tracing(cli.log_format, level);
    debug!(version = terrarun_core::VERSION, "terrarun starting");

    let (kind, args) = cli.command.split();
    cmd_run(kind, args).await
}
