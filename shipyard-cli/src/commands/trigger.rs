//! Trigger command handler

use anyhow::{Result, bail};
use colored::*;
use shipyard_core::domain::run::RunStatus;
use shipyard_core::dto::trigger::TriggerEvent;
use std::time::Duration;

use crate::commands::run::{colorize_status, print_run_details};
use crate::config::Config;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub async fn handle_trigger(
    config: &Config,
    branch: String,
    revision: String,
    wait: bool,
) -> Result<()> {
    let client = config.client();
    let response = client.trigger(&TriggerEvent::new(branch, revision)).await?;

    let Some(run) = response.run.filter(|_| response.accepted) else {
        println!(
            "{} {}",
            "⚠ Trigger ignored:".yellow(),
            response.reason.unwrap_or_default()
        );
        return Ok(());
    };

    println!("{}", "✓ Run queued".green());
    println!("  ID:       {}", run.id.to_string().cyan());
    println!("  Revision: {}", run.revision);
    println!("  Status:   {}", colorize_status(run.status));

    if !wait {
        return Ok(());
    }

    println!();
    println!("{}", "Waiting for the run to finish...".dimmed());
    let mut last = run.status;
    let finished = loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let current = client.get_run(run.id).await?;
        if current.status != last {
            println!("  {} {}", "▸".cyan(), colorize_status(current.status));
            last = current.status;
        }
        if current.status.is_terminal() {
            break current;
        }
    };

    println!();
    print_run_details(&finished);

    if finished.status != RunStatus::Succeeded {
        bail!("Run {} ended {}", finished.id, finished.status);
    }
    Ok(())
}
