//! Stack API Handlers
//!
//! Read-only views of the provisioned stack.

use axum::{Json, extract::State};
use shipyard_core::domain::grant::PermissionGrant;
use shipyard_core::domain::resource::StackOutputs;
use shipyard_core::dto::stack::LedgerSnapshot;
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::orchestrator::PipelineOrchestrator;

/// GET /api/stack/outputs
/// Registry URI and cluster name, once provisioned
pub async fn get_outputs(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
) -> ApiResult<Json<StackOutputs>> {
    orchestrator
        .provisioner()
        .outputs()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Stack is not provisioned".to_string()))
}

/// GET /api/stack/grants
/// Permission grant edges
pub async fn list_grants(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
) -> Json<Vec<PermissionGrant>> {
    Json(orchestrator.binder().grants())
}

/// GET /api/stack/ledger
/// Registry tags and deployment images
pub async fn get_ledger(
    State(orchestrator): State<Arc<PipelineOrchestrator>>,
) -> Json<LedgerSnapshot> {
    Json(orchestrator.provisioner().ledger())
}
