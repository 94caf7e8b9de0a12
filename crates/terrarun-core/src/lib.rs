//! terrarun core library
//!
//! Domain types shared by the lock table, the step executor and the project
//! command runner: what a project invocation is, which workflow it runs,
//! and what it produced.

pub mod cancel;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod key;
pub mod obs;
pub mod plan_summary;
pub mod policy;
pub mod result;
pub mod telemetry;
pub mod workflow;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use command::CommandKind;
pub use config::{
    RepoConfig, RepoConfigProvider, RunnerConfig, StaticRepoConfig, WorkflowDef,
    DEFAULT_OUTPUT_LIMIT_BYTES,
};
pub use context::{ProjectContext, DEFAULT_WORKFLOW, DEFAULT_WORKSPACE};
pub use error::{ConfigError, Result, RunnerError};
pub use key::{LockDomain, LockKey};
pub use plan_summary::PlanSummary;
pub use policy::{PolicySet, PolicySetStatus};
pub use result::{
    FailureCause, ProjectResult, ProjectStatus, StepFault, StepResult, StepStatus,
};
pub use telemetry::{init_tracing, LogFormat};
pub use workflow::{Step, StepKind, Workflow};

/// terrarun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
