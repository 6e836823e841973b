//! Provisioned resource handles
//!
//! Read-only views of the resources the provisioner owns. Consumers never see
//! the resources themselves, only these handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::grant::{Principal, ResourceRef};
use crate::domain::secret::SecretRef;

/// What happens to a resource when the stack is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    /// Keep the resource; its name stays taken
    Retain,
    /// Delete the resource; it may be replaced on spec change
    #[default]
    Destroy,
}

impl std::fmt::Display for RemovalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalPolicy::Retain => write!(f, "retain"),
            RemovalPolicy::Destroy => write!(f, "destroy"),
        }
    }
}

/// Image reference `repository:tag`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Parses `repository[:tag]`, defaulting the tag to `latest`
    ///
    /// Only a colon after the last `/` separates the tag, so a registry host
    /// port (`host:5000/app`) is kept in the repository.
    pub fn parse(image: &str) -> Option<Self> {
        let image = image.trim();
        if image.is_empty() {
            return None;
        }
        // Digests are not tags
        let image = image.split('@').next().unwrap_or(image);
        let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);

        match image[name_start..].rfind(':') {
            Some(offset) => {
                let split = name_start + offset;
                let (repository, tag) = (&image[..split], &image[split + 1..]);
                if repository.is_empty() || tag.is_empty() {
                    return None;
                }
                Some(Self::new(repository, tag))
            }
            None => Some(Self::new(image, "latest")),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Handle to the provisioned network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHandle {
    pub id: Uuid,
    pub name: String,
    pub availability_zones: u32,
    pub nat_gateways: u32,
}

/// Handle to the provisioned container registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryHandle {
    pub id: Uuid,
    pub name: String,
    /// Fully qualified repository URI images are pushed to
    pub uri: String,
    pub policy: RemovalPolicy,
}

impl RegistryHandle {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::registry(&self.name)
    }

    /// Whether the image belongs to this registry's repository
    pub fn owns(&self, image: &ImageRef) -> bool {
        image.repository == self.uri
    }
}

/// Handle to the provisioned Kubernetes cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHandle {
    pub id: Uuid,
    pub name: String,
    pub endpoint: String,
    pub version: String,
}

impl ClusterHandle {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::cluster(&self.name)
    }
}

/// Everything a provisioning pass hands to the rest of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandles {
    pub network: NetworkHandle,
    pub registry: RegistryHandle,
    pub cluster: ClusterHandle,
    pub secret: SecretRef,
    /// Execution identity the build stage runs as
    pub build_identity: Principal,
}

/// Read-only stack outputs, available after a successful provisioning pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutputs {
    pub registry_uri: String,
    pub cluster_name: String,
    pub provisioned_at: DateTime<Utc>,
}

/// Ledger entry for one registry tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub image: ImageRef,
    /// Run whose build pushed the tag
    pub run_id: Uuid,
    pub revision: String,
    pub pushed_at: DateTime<Utc>,
    /// False when the pushing run did not succeed
    pub complete: bool,
}

/// Ledger entry for the image a deployment container runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployment: String,
    pub container: String,
    pub image: ImageRef,
    pub run_id: Uuid,
    pub updated_at: DateTime<Utc>,
}
