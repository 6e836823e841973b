//! ID resolver module
//!
//! Resolves run ID prefixes to full UUIDs by listing runs, so users can type
//! a short unambiguous prefix instead of a full UUID.

use anyhow::{Context, Result, anyhow};
use shipyard_client::OrchestratorClient;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolve a run ID or prefix to a full UUID
///
/// A full UUID is returned as is. A prefix must match exactly one run.
pub async fn resolve_run_id(client: &OrchestratorClient, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let runs = client
        .list_runs()
        .await
        .context("Failed to fetch runs for ID resolution")?;

    select_unique(runs.iter().map(|r| r.id), id_or_prefix)
}

fn select_unique(ids: impl Iterator<Item = Uuid>, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    let matches: Vec<Uuid> = ids.filter(|id| id_or_prefix.matches(*id)).collect();

    match matches.as_slice() {
        [] => Err(anyhow!(
            "No run found with ID starting with '{}'",
            id_or_prefix
        )),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple runs: {}",
                id_or_prefix,
                ids.join(", ")
            ))
        }
    }
}
