//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{PipelineRun, RunStatus};

/// Summary information about a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub pipeline: String,
    pub branch: String,
    pub revision: String,
    pub status: RunStatus,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Terminal build state, e.g. `Failed(PostBuilding, PhaseExecutionError)`
    pub build_state: Option<String>,

    /// Human readable failure, if the run failed
    pub failure: Option<String>,

    /// Whether the run left effects behind without succeeding
    pub partial: bool,
}

impl From<&PipelineRun> for RunSummary {
    fn from(run: &PipelineRun) -> Self {
        RunSummary {
            id: run.id,
            pipeline: run.pipeline.clone(),
            branch: run.branch.clone(),
            revision: run.revision.clone(),
            status: run.status,
            requested_at: run.requested_at,
            completed_at: run.completed_at,
            build_state: run.build.as_ref().map(|b| b.state.to_string()),
            failure: run.failure.as_ref().map(|f| f.to_string()),
            partial: run.has_partial_effects(),
        }
    }
}

impl From<PipelineRun> for RunSummary {
    fn from(run: PipelineRun) -> Self {
        RunSummary::from(&run)
    }
}
