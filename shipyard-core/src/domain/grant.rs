//! Permission grant domain types
//!
//! A grant is a directed edge `principal -> (resource, capability)`.
//! Capabilities are scoped to one resource kind and never imply each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureCause;

/// An execution identity that can receive grants
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of provisioned resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Network,
    Registry,
    Cluster,
    Secret,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Registry => write!(f, "registry"),
            ResourceKind::Cluster => write!(f, "cluster"),
            ResourceKind::Secret => write!(f, "secret"),
        }
    }
}

/// Reference to a resource by kind and logical name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn registry(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Registry, name)
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Cluster, name)
    }

    pub fn secret(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Secret, name)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A single scoped capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Pull images and obtain registry login tokens
    Pull,
    /// Push images
    Push,
    /// Administer deployments on a cluster
    Deploy,
    /// Read a secret's value
    Read,
}

impl Capability {
    /// Whether this capability can be granted on the given resource kind
    pub fn applies_to(self, kind: ResourceKind) -> bool {
        matches!(
            (self, kind),
            (Capability::Pull, ResourceKind::Registry)
                | (Capability::Push, ResourceKind::Registry)
                | (Capability::Deploy, ResourceKind::Cluster)
                | (Capability::Read, ResourceKind::Secret)
        )
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Pull => write!(f, "pull"),
            Capability::Push => write!(f, "push"),
            Capability::Deploy => write!(f, "deploy"),
            Capability::Read => write!(f, "read"),
        }
    }
}

/// An auditable authorization edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub principal: Principal,
    pub resource: ResourceRef,
    pub capability: Capability,
    pub granted_at: DateTime<Utc>,
}

impl PermissionGrant {
    /// Whether this grant covers exactly the requested edge
    pub fn covers(&self, principal: &Principal, resource: &ResourceRef, capability: Capability) -> bool {
        &self.principal == principal && &self.resource == resource && self.capability == capability
    }
}

/// Answers whether a principal holds a capability on a resource
///
/// The build runner only sees this trait; the access binder implements it.
pub trait Authorizer: Send + Sync {
    fn check(
        &self,
        principal: &Principal,
        resource: &ResourceRef,
        capability: Capability,
    ) -> Result<(), FailureCause>;
}
