//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod buildspec;
mod run;
mod stack;
mod trigger;

pub use buildspec::BuildSpecCommands;
pub use run::RunCommands;
pub use stack::StackCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Submit a change event for a branch and revision
    Trigger {
        /// Branch the change was pushed to
        #[arg(long, default_value = "main")]
        branch: String,

        /// Commit identifier to build
        #[arg(long)]
        revision: String,

        /// Wait for the run to finish and exit non-zero if it did not succeed
        #[arg(short, long)]
        wait: bool,
    },
    /// Pipeline run inspection
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Provisioned stack views
    Stack {
        #[command(subcommand)]
        command: StackCommands,
    },
    /// Build spec checks that need no orchestrator
    Buildspec {
        #[command(subcommand)]
        command: BuildSpecCommands,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Trigger {
            branch,
            revision,
            wait,
        } => trigger::handle_trigger(config, branch, revision, wait).await,
        Commands::Run { command } => run::handle_run_command(command, config).await,
        Commands::Stack { command } => stack::handle_stack_command(command, config).await,
        Commands::Buildspec { command } => buildspec::handle_buildspec_command(command),
    }
}
