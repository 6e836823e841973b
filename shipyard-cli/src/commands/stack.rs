//! Stack command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;

use crate::config::Config;

/// Stack subcommands
#[derive(Subcommand)]
pub enum StackCommands {
    /// Registry URI and cluster name
    Outputs,
    /// Permission grants of the build identity
    Grants,
    /// Registry tags and deployment images
    Ledger,
}

pub async fn handle_stack_command(command: StackCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        StackCommands::Outputs => {
            let outputs = client.stack_outputs().await?;
            println!("{}", "Stack Outputs:".bold());
            println!("  Registry URI: {}", outputs.registry_uri.cyan());
            println!("  Cluster:      {}", outputs.cluster_name.cyan());
            println!(
                "  Provisioned:  {}",
                outputs.provisioned_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        StackCommands::Grants => {
            let grants = client.stack_grants().await?;
            if grants.is_empty() {
                println!("{}", "No grants bound.".yellow());
            }
            for grant in &grants {
                println!(
                    "  {} {} {} {}",
                    "▸".cyan(),
                    grant.principal,
                    grant.capability.to_string().bold(),
                    grant.resource
                );
            }
        }
        StackCommands::Ledger => {
            let ledger = client.stack_ledger().await?;

            println!("{}", "Registry Tags:".bold());
            if ledger.tags.is_empty() {
                println!("  {}", "none".dimmed());
            }
            for tag in &ledger.tags {
                let state = if tag.complete {
                    "complete".green()
                } else {
                    "incomplete".yellow()
                };
                println!(
                    "  {:<12} {} (revision {}, run {})",
                    tag.image.tag,
                    state,
                    tag.revision,
                    tag.run_id.to_string().dimmed()
                );
            }

            println!("\n{}", "Deployments:".bold());
            if ledger.deployments.is_empty() {
                println!("  {}", "none".dimmed());
            }
            for deployment in &ledger.deployments {
                println!(
                    "  deployment/{} {}={}",
                    deployment.deployment,
                    deployment.container,
                    deployment.image.to_string().cyan()
                );
            }
        }
    }

    Ok(())
}
