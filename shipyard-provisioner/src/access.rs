//! Access binder
//!
//! Owns the permission grant edges between execution identities and
//! provisioned resources. Grants are additive and exact; there is no
//! revocation.

use chrono::Utc;
use std::sync::{PoisonError, RwLock};

use shipyard_core::domain::grant::{Authorizer, Capability, PermissionGrant, Principal, ResourceRef};
use shipyard_core::domain::resource::ResourceHandles;
use shipyard_core::{FailureCause, ProvisioningError};

#[derive(Debug, Default)]
pub struct AccessBinder {
    grants: RwLock<Vec<PermissionGrant>>,
}

impl AccessBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the edge `principal -> (resource, capability)`
    ///
    /// Returns `false` when the edge already existed.
    pub fn bind(
        &self,
        principal: &Principal,
        resource: &ResourceRef,
        capability: Capability,
    ) -> Result<bool, ProvisioningError> {
        if !capability.applies_to(resource.kind) {
            return Err(ProvisioningError::InvalidGrant {
                resource: resource.clone(),
                capability,
            });
        }

        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        if grants.iter().any(|g| g.covers(principal, resource, capability)) {
            return Ok(false);
        }

        grants.push(PermissionGrant {
            principal: principal.clone(),
            resource: resource.clone(),
            capability,
            granted_at: Utc::now(),
        });
        tracing::info!("Granted {} {} on {}", principal, capability, resource);
        Ok(true)
    }

    pub fn has(&self, principal: &Principal, resource: &ResourceRef, capability: Capability) -> bool {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|g| g.covers(principal, resource, capability))
    }

    /// All grant edges, in the order they were bound
    pub fn grants(&self) -> Vec<PermissionGrant> {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Authorizer for AccessBinder {
    fn check(
        &self,
        principal: &Principal,
        resource: &ResourceRef,
        capability: Capability,
    ) -> Result<(), FailureCause> {
        if self.has(principal, resource, capability) {
            Ok(())
        } else {
            tracing::warn!("Denied {} {} on {}", principal, capability, resource);
            Err(FailureCause::unauthorized(principal, resource, capability))
        }
    }
}

/// Grants the build identity what the build stage needs
///
/// Registry push and pull, cluster deploy, and read on the application secret.
pub fn grant_build_access(
    binder: &AccessBinder,
    handles: &ResourceHandles,
) -> Result<(), ProvisioningError> {
    let identity = &handles.build_identity;
    let registry = handles.registry.resource();

    binder.bind(identity, &registry, Capability::Push)?;
    binder.bind(identity, &registry, Capability::Pull)?;
    binder.bind(identity, &handles.cluster.resource(), Capability::Deploy)?;
    binder.bind(identity, &ResourceRef::secret(&handles.secret.name), Capability::Read)?;
    Ok(())
}
