//! Run domain types
//!
//! `BuildState`/`BuildOutcome` describe one execution of the build stage;
//! `PipelineRun` is the record the orchestrator persists for a trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::artifact::Artifact;
use crate::domain::buildspec::PhaseName;
use crate::domain::resource::ImageRef;
use crate::domain::stage::StageName;
use crate::error::FailureCause;

// =============================================================================
// Build stage
// =============================================================================

/// State of the build stage runner
///
/// `Succeeded`, `Failed` and `Cancelled` are absorbing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Installing,
    PreBuilding,
    Building,
    PostBuilding,
    Succeeded,
    Failed {
        phase: PhaseName,
        cause: FailureCause,
    },
    Cancelled {
        phase: Option<PhaseName>,
    },
}

impl BuildState {
    /// The running state for a phase
    pub fn running(phase: PhaseName) -> Self {
        match phase {
            PhaseName::Install => BuildState::Installing,
            PhaseName::PreBuild => BuildState::PreBuilding,
            PhaseName::Build => BuildState::Building,
            PhaseName::PostBuild => BuildState::PostBuilding,
        }
    }

    /// The phase this state is running, if any
    pub fn phase(&self) -> Option<PhaseName> {
        match self {
            BuildState::Installing => Some(PhaseName::Install),
            BuildState::PreBuilding => Some(PhaseName::PreBuild),
            BuildState::Building => Some(PhaseName::Build),
            BuildState::PostBuilding => Some(PhaseName::PostBuild),
            BuildState::Failed { phase, .. } => Some(*phase),
            BuildState::Cancelled { phase } => *phase,
            BuildState::Pending | BuildState::Succeeded => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Succeeded | BuildState::Failed { .. } | BuildState::Cancelled { .. }
        )
    }

    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            BuildState::Failed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

fn running_label(phase: PhaseName) -> &'static str {
    match phase {
        PhaseName::Install => "Installing",
        PhaseName::PreBuild => "PreBuilding",
        PhaseName::Build => "Building",
        PhaseName::PostBuild => "PostBuilding",
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildState::Pending => write!(f, "Pending"),
            BuildState::Succeeded => write!(f, "Succeeded"),
            BuildState::Failed { phase, cause } => {
                write!(f, "Failed({}, {})", running_label(*phase), cause.label())
            }
            BuildState::Cancelled { phase: Some(phase) } => {
                write!(f, "Cancelled({})", running_label(*phase))
            }
            BuildState::Cancelled { phase: None } => write!(f, "Cancelled"),
            running => match running.phase() {
                Some(phase) => write!(f, "{}", running_label(phase)),
                None => write!(f, "Pending"),
            },
        }
    }
}

/// One executed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub phase: PhaseName,
    /// Command text as declared in the build spec
    pub command: String,
    /// `None` when the command never produced an exit status
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CommandRecord {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An externally visible mutation performed by a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    /// An image tag was pushed to a registry
    ImagePushed { image: ImageRef },
    /// A manifest was applied to the cluster
    ManifestApplied { manifest: String },
    /// A deployment container was switched to a new image
    DeploymentUpdated {
        deployment: String,
        container: String,
        image: ImageRef,
    },
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effect::ImagePushed { image } => write!(f, "pushed {}", image),
            Effect::ManifestApplied { manifest } => write!(f, "applied {}", manifest),
            Effect::DeploymentUpdated {
                deployment,
                container,
                image,
            } => write!(f, "deployment/{} {}={}", deployment, container, image),
        }
    }
}

/// Result of one build stage execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub state: BuildState,
    /// Phases entered, in order
    pub visited: Vec<PhaseName>,
    pub commands: Vec<CommandRecord>,
    pub effects: Vec<Effect>,
}

impl BuildOutcome {
    pub fn new(state: BuildState) -> Self {
        Self {
            state,
            visited: Vec::new(),
            commands: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == BuildState::Succeeded
    }

    /// The run did not succeed but left external effects behind
    pub fn is_partial(&self) -> bool {
        !self.succeeded() && !self.effects.is_empty()
    }

    /// Commands executed within a phase
    pub fn commands_in(&self, phase: PhaseName) -> impl Iterator<Item = &CommandRecord> {
        self.commands.iter().filter(move |c| c.phase == phase)
    }

    pub fn pushed_images(&self) -> impl Iterator<Item = &ImageRef> {
        self.effects.iter().filter_map(|e| match e {
            Effect::ImagePushed { image } => Some(image),
            _ => None,
        })
    }
}

// =============================================================================
// Pipeline run
// =============================================================================

/// Pipeline run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
    /// A newer revision was fetched before this run could build
    Superseded,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::InProgress)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "Queued"),
            RunStatus::InProgress => write!(f, "InProgress"),
            RunStatus::Succeeded => write!(f, "Succeeded"),
            RunStatus::Failed => write!(f, "Failed"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
            RunStatus::Superseded => write!(f, "Superseded"),
        }
    }
}

/// Status of a single stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

/// Record of one stage's execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage: StageName,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Where and why a run failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: StageName,
    /// Build phase, for failures inside the build stage
    pub phase: Option<PhaseName>,
    pub cause: FailureCause,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "{} stage, {} phase: {}", self.stage, phase, self.cause),
            None => write!(f, "{} stage: {}", self.stage, self.cause),
        }
    }
}

/// Pipeline run record
///
/// Created by the orchestrator on an accepted trigger and updated as stages
/// progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline: String,
    pub branch: String,
    pub revision: String,
    pub status: RunStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageExecution>,
    pub source_artifact: Option<Artifact>,
    pub build: Option<BuildOutcome>,
    pub failure: Option<RunFailure>,
}

impl PipelineRun {
    pub fn new(
        pipeline: impl Into<String>,
        branch: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            branch: branch.into(),
            revision: revision.into(),
            status: RunStatus::Queued,
            requested_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stages: Vec::new(),
            source_artifact: None,
            build: None,
            failure: None,
        }
    }

    pub fn start_stage(&mut self, stage: StageName) {
        let now = Utc::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.status = RunStatus::InProgress;
        self.stages.push(StageExecution {
            stage,
            status: StageStatus::InProgress,
            started_at: now,
            completed_at: None,
        });
    }

    /// Closes the most recent execution of `stage`
    pub fn complete_stage(&mut self, stage: StageName, status: StageStatus) {
        if let Some(exec) = self.stages.iter_mut().rev().find(|s| s.stage == stage) {
            exec.status = status;
            exec.completed_at = Some(Utc::now());
        }
    }

    /// Moves the run to a terminal status
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, failure: RunFailure) {
        self.complete_stage(failure.stage, StageStatus::Failed);
        self.failure = Some(failure);
        self.finish(RunStatus::Failed);
    }

    /// Terminal without success, with external effects left behind
    pub fn has_partial_effects(&self) -> bool {
        self.status != RunStatus::Succeeded
            && self.build.as_ref().is_some_and(|b| !b.effects.is_empty())
    }

    pub fn effects(&self) -> &[Effect] {
        self.build
            .as_ref()
            .map(|b| b.effects.as_slice())
            .unwrap_or(&[])
    }
}
