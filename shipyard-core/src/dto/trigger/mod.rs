//! Trigger DTOs

use serde::{Deserialize, Serialize};

use crate::dto::run::RunSummary;

/// A source change event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Branch name, with or without the `refs/heads/` prefix
    pub branch: String,
    /// Commit identifier to build
    pub revision: String,
}

impl TriggerEvent {
    pub fn new(branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            revision: revision.into(),
        }
    }

    /// Revision to build, trimmed and checked
    ///
    /// A revision is a commit hash or ref name: it may not be empty, may not
    /// start with `-` and is limited to `[A-Za-z0-9._/-]`.
    pub fn checked_revision(&self) -> Result<&str, String> {
        let revision = self.revision.trim();
        check_revision(revision)?;
        Ok(revision)
    }

    /// Branch name without the `refs/heads/` prefix
    pub fn branch_name(&self) -> &str {
        self.branch
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.branch)
    }
}

/// Rejects revisions that could be read as an option or break an image tag
pub fn check_revision(revision: &str) -> Result<(), String> {
    if revision.is_empty() {
        return Err("revision cannot be empty".to_string());
    }
    if revision.starts_with('-') {
        return Err(format!("revision '{}' cannot start with '-'", revision));
    }
    if let Some(c) = revision
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')))
    {
        return Err(format!("revision '{}' contains invalid character {:?}", revision, c));
    }
    Ok(())
}

/// Orchestrator answer to a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub accepted: bool,
    pub run: Option<RunSummary>,
    /// Why the trigger was ignored
    pub reason: Option<String>,
}
