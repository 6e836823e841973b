//! Shipyard HTTP Client
//!
//! A type-safe HTTP client for the Shipyard orchestrator API, used by the CLI.
//!
//! # Example
//!
//! ```no_run
//! use shipyard_client::OrchestratorClient;
//! use shipyard_core::dto::trigger::TriggerEvent;
//!
//! #[tokio::main]
//! async fn main() -> shipyard_client::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let response = client.trigger(&TriggerEvent::new("main", "abc123")).await?;
//!     if let Some(run) = response.run {
//!         println!("Queued run {}", run.id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod runs;
mod stack;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the Shipyard orchestrator API
///
/// Methods are grouped by resource:
/// - Triggers and runs (submit, list, get, cancel, logs)
/// - Stack views (outputs, grants, ledger)
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check that the orchestrator answers its health endpoint
    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::api_error(status.as_u16(), text));
        }
        Ok(())
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("Orchestrator answered {}: {}", status, error_text);
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}
