//! Trigger and run endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use shipyard_core::domain::log::LogEntry;
use shipyard_core::domain::run::PipelineRun;
use shipyard_core::dto::run::RunSummary;
use shipyard_core::dto::trigger::{TriggerEvent, TriggerResponse};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Triggers
    // =============================================================================

    /// Submit a source change event
    ///
    /// The response says whether the pipeline accepted it; an ignored branch
    /// is not an error.
    pub async fn trigger(&self, event: &TriggerEvent) -> Result<TriggerResponse> {
        let response = self
            .client
            .post(self.url("/api/triggers"))
            .json(event)
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Runs
    // =============================================================================

    /// List all runs, newest first
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let response = self.client.get(self.url("/api/runs")).send().await?;

        self.handle_response(response).await
    }

    /// Get the full record of a run
    pub async fn get_run(&self, id: Uuid) -> Result<PipelineRun> {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{}", id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a run that has not finished
    ///
    /// The returned summary predates the cancellation; poll `get_run` to see
    /// the run reach `Cancelled`.
    pub async fn cancel_run(&self, id: Uuid) -> Result<RunSummary> {
        let response = self
            .client
            .post(self.url(&format!("/api/runs/{}/cancel", id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get the log of a run
    pub async fn get_run_logs(&self, id: Uuid) -> Result<Vec<LogEntry>> {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{}/logs", id)))
            .send()
            .await?;

        self.handle_response(response).await
    }
}
