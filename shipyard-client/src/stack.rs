//! Stack endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use shipyard_core::domain::grant::PermissionGrant;
use shipyard_core::domain::resource::StackOutputs;
use shipyard_core::dto::stack::LedgerSnapshot;

impl OrchestratorClient {
    /// Registry URI and cluster name of the provisioned stack
    pub async fn stack_outputs(&self) -> Result<StackOutputs> {
        let response = self.client.get(self.url("/api/stack/outputs")).send().await?;

        self.handle_response(response).await
    }

    pub async fn stack_grants(&self) -> Result<Vec<PermissionGrant>> {
        let response = self.client.get(self.url("/api/stack/grants")).send().await?;

        self.handle_response(response).await
    }

    /// Registry tags and deployment images recorded so far
    pub async fn stack_ledger(&self) -> Result<LedgerSnapshot> {
        let response = self.client.get(self.url("/api/stack/ledger")).send().await?;

        self.handle_response(response).await
    }
}
