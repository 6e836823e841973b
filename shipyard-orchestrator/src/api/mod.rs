//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod run;
pub mod stack;
pub mod trigger;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::orchestrator::PipelineOrchestrator;

/// Create the main API router with all endpoints
pub fn create_router(orchestrator: Arc<PipelineOrchestrator>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Trigger endpoint
        .route("/api/triggers", post(trigger::submit_trigger))
        // Run endpoints
        .route("/api/runs", get(run::list_runs))
        .route("/api/runs/{id}", get(run::get_run))
        .route("/api/runs/{id}/cancel", post(run::cancel_run))
        .route("/api/runs/{id}/logs", get(run::get_run_logs))
        // Stack endpoints
        .route("/api/stack/outputs", get(stack::get_outputs))
        .route("/api/stack/grants", get(stack::list_grants))
        .route("/api/stack/ledger", get(stack::get_ledger))
        // Add state and middleware
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
}
