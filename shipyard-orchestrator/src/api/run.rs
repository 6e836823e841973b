//! Run API Handlers
//!
//! HTTP endpoints for inspecting and cancelling pipeline runs.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use shipyard_core::domain::log::LogEntry;
use shipyard_core::domain::run::PipelineRun;
use shipyard_core::dto::run::RunSummary;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::orchestrator::PipelineOrchestrator;

/// GET /api/runs
/// List all runs, newest first
pub async fn list_runs(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    tracing::debug!("Listing runs");

    let runs = orchestrator.list_runs().await?;
    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

/// GET /api/runs/{id}
/// Get the full run record
pub async fn get_run(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::debug!("Getting run: {}", id);

    Ok(Json(orchestrator.get_run(id).await?))
}

/// POST /api/runs/{id}/cancel
/// Cancel a run that has not finished
///
/// Answers 202 with the run as it was when cancellation was requested.
pub async fn cancel_run(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<RunSummary>)> {
    tracing::info!("Cancelling run: {}", id);

    let run = orchestrator.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(RunSummary::from(run))))
}

/// GET /api/runs/{id}/logs
/// Get all logs for a run
pub async fn get_run_logs(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    tracing::debug!("Getting logs for run: {}", id);

    Ok(Json(orchestrator.run_logs(id).await?))
}
