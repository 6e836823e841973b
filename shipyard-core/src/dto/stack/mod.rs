//! Stack DTOs

use serde::{Deserialize, Serialize};

use crate::domain::resource::{DeploymentRecord, TagRecord};

/// Registry tags and deployment images recorded by the provisioner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub tags: Vec<TagRecord>,
    pub deployments: Vec<DeploymentRecord>,
}

impl LedgerSnapshot {
    pub fn tag(&self, tag: &str) -> Option<&TagRecord> {
        self.tags.iter().find(|t| t.image.tag == tag)
    }

    pub fn deployment(&self, deployment: &str, container: &str) -> Option<&DeploymentRecord> {
        self.deployments
            .iter()
            .find(|d| d.deployment == deployment && d.container == container)
    }
}
