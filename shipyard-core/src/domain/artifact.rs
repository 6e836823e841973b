//! Artifact domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::domain::stage::StageName;

/// Immutable hand-off payload between stages
///
/// Fields are private so an artifact cannot change after it is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    id: Uuid,
    name: String,
    location: PathBuf,
    produced_by: StageName,
    revision: String,
    created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        location: impl Into<PathBuf>,
        produced_by: StageName,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            location: location.into(),
            produced_by,
            revision: revision.into(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage-scoped identity, e.g. `Source/SourceOutput`
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.produced_by, self.name)
    }

    pub fn location(&self) -> &std::path::Path {
        &self.location
    }

    pub fn produced_by(&self) -> StageName {
        self.produced_by
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_name() {
        let artifact = Artifact::new("SourceOutput", "/tmp/src", StageName::Source, "abc123");
        assert_eq!(artifact.qualified_name(), "Source/SourceOutput");
        assert_eq!(artifact.revision(), "abc123");
        assert_eq!(artifact.produced_by(), StageName::Source);
    }
}
