//! terrarun runner
//!
//! Executes project commands against a checked-out repository:
//! - Resolves the workflow for a command (built-in or repository-defined)
//! - Serializes mutating commands per project through the shared lock table
//! - Runs the steps in order as child processes, fail-fast
//! - Reports one `ProjectResult` per invocation

pub mod approval;
pub mod builtin;
pub mod executor;
pub mod resolver;
pub mod runner;

// Re-export key types
pub use executor::{truncate_output, ProcessStepExecutor, StepExecutor, StepOutcome};
pub use resolver::WorkflowResolver;
pub use runner::ProjectCommandRunner;
