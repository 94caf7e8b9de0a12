//! Built-in tool steps: argument layout and environment.

use std::collections::BTreeMap;

use terrarun_core::{ProjectContext, Step, StepKind, DEFAULT_WORKSPACE};

/// Arguments passed to the infrastructure tool for a built-in step.
///
/// Layout: subcommand and fixed flags, then the step's own args, then the
/// user's extra args for steps that accept them. Apply and show take the
/// plan file last. Returns `None` for steps that are not tool invocations.
pub fn tool_args(step: &Step, ctx: &ProjectContext) -> Option<Vec<String>> {
    let plan_file = ctx.plan_file_name();
    let fixed: Vec<String> = match &step.kind {
        StepKind::Init => vec!["init".into(), "-input=false".into()],
        StepKind::Plan => vec![
            "plan".into(),
            "-input=false".into(),
            "-refresh".into(),
            "-out".into(),
            plan_file.clone(),
        ],
        StepKind::Show => vec!["show".into(), "-json".into()],
        StepKind::Apply => vec!["apply".into(), "-input=false".into()],
        StepKind::Import => vec!["import".into(), "-input=false".into()],
        StepKind::StateRm => vec!["state".into(), "rm".into()],
        StepKind::Version => vec!["version".into()],
        StepKind::PolicyCheck
        | StepKind::ApprovePolicies
        | StepKind::Run { .. }
        | StepKind::Env { .. } => return None,
    };

    let mut args = fixed;
    args.extend(step.args.iter().cloned());
    if step.kind.accepts_extra_args() {
        args.extend(ctx.extra_args.iter().cloned());
    }
    if matches!(step.kind, StepKind::Apply | StepKind::Show) {
        args.push(plan_file);
    }
    Some(args)
}

/// Whether a successful run of this step leaves the saved plan stale.
pub fn invalidates_plan(kind: &StepKind) -> bool {
    matches!(kind, StepKind::Apply | StepKind::Import | StepKind::StateRm)
}

/// Environment for built-in tool steps.
pub fn tool_env(ctx: &ProjectContext) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TF_IN_AUTOMATION".to_string(), "true".to_string());
    if ctx.workspace != DEFAULT_WORKSPACE {
        env.insert("TF_WORKSPACE".to_string(), ctx.workspace.clone());
    }
    env
}

/// Environment exported to `run` and `env` steps describing the invocation.
pub fn standard_env(ctx: &ProjectContext) -> BTreeMap<String, String> {
    let (owner, name) = ctx.repo_owner_and_name();
    let pairs = [
        ("WORKSPACE", ctx.workspace.clone()),
        ("DIR", ctx.project_dir().to_string_lossy().into_owned()),
        ("PLANFILE", ctx.plan_file().to_string_lossy().into_owned()),
        ("SHOWFILE", ctx.show_file().to_string_lossy().into_owned()),
        ("BASE_REPO_NAME", name.to_string()),
        ("BASE_REPO_OWNER", owner.to_string()),
        ("HEAD_BRANCH_NAME", ctx.head_branch.clone()),
        ("BASE_BRANCH_NAME", ctx.base_branch.clone()),
        ("HEAD_COMMIT", ctx.head_commit.clone()),
        ("BASE_COMMIT", ctx.base_commit.clone()),
        ("PULL_NUM", ctx.pull_num.to_string()),
        ("PULL_AUTHOR", ctx.pull_author.clone()),
        ("REPO_REL_DIR", ctx.repo_rel_dir.clone()),
        ("USER_NAME", ctx.user.clone()),
        ("COMMENT_ARGS", ctx.extra_args.join(",")),
        ("PROJECT_NAME", ctx.project_name.clone().unwrap_or_default()),
        ("COMMAND_NAME", ctx.command.name().to_string()),
    ];
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
