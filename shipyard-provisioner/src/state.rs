//! Provisioning state
//!
//! Everything the provisioner knows, serializable as one JSON document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use shipyard_core::ProvisioningError;
use shipyard_core::domain::grant::ResourceKind;
use shipyard_core::domain::resource::{RemovalPolicy, ResourceHandles, StackOutputs};

use crate::ledger::Ledger;
use crate::secrets::SecretStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Active,
    /// Survived teardown under a retain policy; the name stays taken
    Retained,
}

/// A provisioned resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub name: String,
    /// Declared spec the resource was created from
    pub spec: serde_json::Value,
    pub policy: RemovalPolicy,
    /// Incremented on each replacement
    pub generation: u32,
    pub status: ResourceStatus,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn resource_key(kind: ResourceKind, name: &str) -> String {
    format!("{}/{}", kind, name)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ProvisionerState {
    pub resources: BTreeMap<String, ResourceRecord>,
    pub secrets: SecretStore,
    pub ledger: Ledger,
    pub handles: Option<ResourceHandles>,
    pub outputs: Option<StackOutputs>,
}

impl ProvisionerState {
    pub fn load(path: &Path) -> Result<Self, ProvisioningError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ProvisioningError::State(format!("{}: {}", path.display(), e)))
    }

    /// Writes the state next to `path` then renames it into place
    pub fn save(&self, path: &Path) -> Result<(), ProvisioningError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ProvisioningError::State(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
