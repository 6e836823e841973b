//! Build stage execution
//!
//! Runs the phases of a build spec against a command executor, enforcing
//! bindings and grants up front and reporting a single terminal outcome.

pub mod command;
pub mod config;
pub mod context;
pub mod executor;
pub mod podman;
pub mod runner;

pub use config::{ExecutorKind, RunnerConfig};
pub use context::BuildContext;
pub use executor::{
    CommandExecutor, CommandOutput, ScriptedExecutor, ShellExecutor, create_executor,
};
pub use runner::{BuildRequest, BuildStageRunner, TIMEOUT_EXIT_CODE};
