//! Run command handlers
//!
//! Listing, details, logs and cancellation of pipeline runs.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use shipyard_core::domain::log::{LogEntry, LogLevel};
use shipyard_core::domain::run::{PipelineRun, RunStatus, StageStatus};
use shipyard_core::dto::run::RunSummary;

use crate::config::Config;
use crate::id_resolver::resolve_run_id;
use crate::types::IdOrPrefix;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// List all runs, newest first
    List,
    /// Get run details
    Get {
        /// Run ID or unambiguous prefix
        id: String,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Get run logs
    Logs {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Cancel a run that has not finished
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
}

pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        RunCommands::List => {
            let runs = client.list_runs().await?;
            if runs.is_empty() {
                println!("{}", "No runs found.".yellow());
            } else {
                println!("{}", format!("Found {} run(s):", runs.len()).bold());
                println!();
                for run in &runs {
                    print_run_summary(run);
                }
            }
        }
        RunCommands::Get { id, json } => {
            let uuid = resolve_run_id(&client, &IdOrPrefix::parse(&id)).await?;
            let run = client.get_run(uuid).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run_details(&run);
            }
        }
        RunCommands::Logs { id } => {
            let uuid = resolve_run_id(&client, &IdOrPrefix::parse(&id)).await?;
            let logs = client.get_run_logs(uuid).await?;
            if logs.is_empty() {
                println!("{}", "No logs found for this run.".yellow());
            } else {
                println!("{}", format!("Logs for run {}:", uuid).bold());
                println!("{}", "─".repeat(80).dimmed());
                for log in &logs {
                    print_log_entry(log);
                }
                println!("{}", "─".repeat(80).dimmed());
            }
        }
        RunCommands::Cancel { id } => {
            let uuid = resolve_run_id(&client, &IdOrPrefix::parse(&id)).await?;
            let run = client.cancel_run(uuid).await?;
            println!(
                "{} {} (was {}, cancelling)",
                "✓ Cancellation requested for run".green(),
                run.id.to_string().cyan(),
                colorize_status(run.status)
            );
        }
    }

    Ok(())
}

fn print_run_summary(run: &RunSummary) {
    println!("  {} Run {}", "▸".cyan(), run.id.to_string().dimmed());
    println!("    Revision: {} ({})", run.revision, run.branch);
    println!("    Status:   {}", colorize_status(run.status));
    println!(
        "    Queued:   {}",
        run.requested_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(state) = &run.build_state {
        println!("    Build:    {}", state);
    }
    if run.partial {
        println!("    {}", "⚠ left partial effects".yellow());
    }
    println!();
}

pub fn print_run_details(run: &PipelineRun) {
    println!("{}", "Run Details:".bold());
    println!("  ID:        {}", run.id.to_string().cyan());
    println!("  Pipeline:  {}", run.pipeline);
    println!("  Branch:    {}", run.branch);
    println!("  Revision:  {}", run.revision);
    println!("  Status:    {}", colorize_status(run.status));
    println!(
        "  Requested: {}",
        run.requested_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(started) = run.started_at {
        println!("  Started:   {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
        if let Some(started) = run.started_at {
            let seconds = completed.signed_duration_since(started).num_seconds();
            println!("  Duration:  {}s", seconds);
        }
    }

    if !run.stages.is_empty() {
        println!("\n{}", "Stages:".bold());
        for stage in &run.stages {
            let status = format!("{:?}", stage.status);
            let status = match stage.status {
                StageStatus::InProgress => status.cyan(),
                StageStatus::Succeeded => status.green(),
                StageStatus::Failed => status.red(),
                StageStatus::Cancelled => status.dimmed(),
            };
            println!("  {:<8} {}", stage.stage.to_string(), status);
        }
    }

    if let Some(artifact) = &run.source_artifact {
        println!("\n{}", "Artifact:".bold());
        println!("  {} @ {}", artifact.qualified_name(), artifact.revision());
    }

    if let Some(build) = &run.build {
        println!("\n{}", "Build:".bold());
        println!("  State: {}", build.state);
        for command in &build.commands {
            let mark = if command.succeeded() {
                "✓".green()
            } else {
                "✗".red()
            };
            println!(
                "  {} [{}] {} ({}ms)",
                mark,
                command.phase,
                command.command,
                command.duration_ms
            );
        }
        if !build.effects.is_empty() {
            println!("\n{}", "Effects:".bold());
            for effect in &build.effects {
                println!("  {} {}", "▸".cyan(), effect);
            }
        }
    }

    if let Some(failure) = &run.failure {
        println!("\n{}", "Failure:".bold());
        println!("{}", failure.to_string().red());
        if run.has_partial_effects() {
            println!(
                "{}",
                "Effects above were applied before the failure and were not rolled back."
                    .yellow()
            );
        }
    }
}

fn print_log_entry(log: &LogEntry) {
    let level_str = format!("{:?}", log.level).to_uppercase();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    println!(
        "{} [{}] {}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        log.message
    );
}

pub fn colorize_status(status: RunStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        RunStatus::Queued => status_str.yellow(),
        RunStatus::InProgress => status_str.cyan(),
        RunStatus::Succeeded => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::Cancelled | RunStatus::Superseded => status_str.dimmed(),
    }
}
