//! Stage graph domain types
//!
//! The pipeline shape is fixed: a `Source` stage that produces the source
//! artifact, followed by a `Build` stage that consumes it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::StageGraphError;

/// Name of the artifact handed from Source to Build
pub const SOURCE_OUTPUT: &str = "SourceOutput";

/// Pipeline stage name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    Source,
    Build,
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageName::Source => write!(f, "Source"),
            StageName::Build => write!(f, "Build"),
        }
    }
}

/// What an action does when its stage runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Fetch a source revision
    SourceFetch,
    /// Run the build project phases
    BuildProject,
}

/// A single action within a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub kind: ActionKind,
    /// Artifact names this action consumes
    pub inputs: Vec<String>,
    /// Artifact names this action produces
    pub outputs: Vec<String>,
}

/// Stage definition: a name and its ordered actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: StageName,
    pub actions: Vec<ActionDefinition>,
}

impl StageDefinition {
    /// All artifacts consumed by this stage's actions
    pub fn consumes(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .flat_map(|a| a.inputs.iter().map(String::as_str))
    }

    /// All artifacts produced by this stage's actions
    pub fn produces(&self) -> impl Iterator<Item = &str> {
        self.actions
            .iter()
            .flat_map(|a| a.outputs.iter().map(String::as_str))
    }
}

/// Pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    /// The only branch whose changes trigger runs
    pub branch: String,
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    /// The standard Source -> Build pipeline
    pub fn standard(name: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branch: branch.into(),
            stages: vec![
                StageDefinition {
                    name: StageName::Source,
                    actions: vec![ActionDefinition {
                        name: "FetchSource".to_string(),
                        kind: ActionKind::SourceFetch,
                        inputs: vec![],
                        outputs: vec![SOURCE_OUTPUT.to_string()],
                    }],
                },
                StageDefinition {
                    name: StageName::Build,
                    actions: vec![ActionDefinition {
                        name: "BuildAndDeploy".to_string(),
                        kind: ActionKind::BuildProject,
                        inputs: vec![SOURCE_OUTPUT.to_string()],
                        outputs: vec![],
                    }],
                },
            ],
        }
    }

    /// Validates the stage graph
    ///
    /// Checks the fixed `[Source, Build]` shape and that every consumed
    /// artifact comes from a strictly earlier stage.
    pub fn validate(&self) -> Result<(), StageGraphError> {
        let names: Vec<StageName> = self.stages.iter().map(|s| s.name).collect();
        if names != [StageName::Source, StageName::Build] {
            return Err(StageGraphError::UnexpectedShape(names));
        }

        let mut produced: HashSet<&str> = HashSet::new();

        for stage in &self.stages {
            if stage.actions.is_empty() {
                return Err(StageGraphError::EmptyStage(stage.name));
            }

            // Checked before this stage's own outputs are added: same-stage
            // hand-offs are not allowed.
            for artifact in stage.consumes() {
                if !produced.contains(artifact) {
                    return Err(StageGraphError::ArtifactNotYetProduced {
                        stage: stage.name,
                        artifact: artifact.to_string(),
                    });
                }
            }

            for artifact in stage.produces() {
                if !produced.insert(artifact) {
                    return Err(StageGraphError::DuplicateArtifact(artifact.to_string()));
                }
            }
        }

        Ok(())
    }

    pub fn stage(&self, name: StageName) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}
