//! Trigger API Handler

use axum::{Json, extract::State, http::StatusCode};
use shipyard_core::dto::run::RunSummary;
use shipyard_core::dto::trigger::{TriggerEvent, TriggerResponse};
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::orchestrator::PipelineOrchestrator;

/// POST /api/triggers
/// Submit a source change event
///
/// Answers 202 with the queued run, or 200 with `accepted = false` when the
/// branch does not trigger the pipeline.
pub async fn submit_trigger(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
    Json(event): Json<TriggerEvent>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    tracing::info!("Trigger received for {} at {}", event.branch, event.revision);

    let branch = event.branch_name().to_string();
    let response = match orchestrator.enqueue(event).await? {
        Some(run) => (
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                accepted: true,
                run: Some(RunSummary::from(run)),
                reason: None,
            }),
        ),
        None => (
            StatusCode::OK,
            Json(TriggerResponse {
                accepted: false,
                run: None,
                reason: Some(format!(
                    "branch '{}' does not trigger pipeline '{}' (follows '{}')",
                    branch,
                    orchestrator.pipeline().name,
                    orchestrator.pipeline().branch
                )),
            }),
        ),
    };

    Ok(response)
}
