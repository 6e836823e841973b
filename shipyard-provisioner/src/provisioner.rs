//! Resource provisioner
//!
//! Creates and owns the network, registry, cluster and secret resources of a
//! stack and hands out read-only handles to them. Provisioning is idempotent
//! per `(kind, name)`: an unchanged resource keeps its handle, a changed one
//! is replaced or rejected depending on its removal policy.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use shipyard_core::domain::grant::{Principal, ResourceKind};
use shipyard_core::domain::resource::{
    ClusterHandle, ImageRef, NetworkHandle, RegistryHandle, RemovalPolicy, ResourceHandles,
    StackOutputs, TagRecord,
};
use shipyard_core::domain::run::Effect;
use shipyard_core::domain::secret::{SecretKeyRef, SecretRef, SecretResolver, SecretValue};
use shipyard_core::dto::stack::LedgerSnapshot;
use shipyard_core::{FailureCause, ProvisioningError};

use crate::config::StackConfig;
use crate::state::{ProvisionerState, ResourceRecord, ResourceStatus, resource_key};

/// In-process owner of the stack's shared resources
///
/// Shared behind an `Arc`; every operation takes the internal lock for its
/// full duration so concurrent provisioning passes cannot interleave.
#[derive(Debug, Default)]
pub struct ResourceProvisioner {
    state: RwLock<ProvisionerState>,
    state_path: Option<PathBuf>,
}

impl ResourceProvisioner {
    /// Creates a provisioner that keeps its state in memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provisioner persisted to a JSON state file
    ///
    /// Existing state at `path` is loaded.
    pub fn with_state_file(path: impl Into<PathBuf>) -> Result<Self, ProvisioningError> {
        let path = path.into();
        let state = ProvisionerState::load(&path)?;
        tracing::info!(
            "Loaded provisioning state from {} ({} resources)",
            path.display(),
            state.resources.len()
        );
        Ok(Self {
            state: RwLock::new(state),
            state_path: Some(path),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, ProvisionerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProvisionerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &ProvisionerState) -> Result<(), ProvisioningError> {
        match &self.state_path {
            Some(path) => state.save(path),
            None => Ok(()),
        }
    }

    /// Provisions every resource declared by `config`
    ///
    /// Returns the handles consumed by the rest of the pipeline and makes the
    /// stack outputs available. On error, resources created before the
    /// failing one are kept, and outputs and handles are unset until a pass
    /// succeeds.
    pub fn provision(&self, config: &StackConfig) -> Result<ResourceHandles, ProvisioningError> {
        config.validate()?;

        let mut state = self.write();
        match provision_resources(&mut state, config) {
            Ok(handles) => {
                state.outputs = Some(StackOutputs {
                    registry_uri: handles.registry.uri.clone(),
                    cluster_name: handles.cluster.name.clone(),
                    provisioned_at: Utc::now(),
                });
                state.handles = Some(handles.clone());
                self.persist(&state)?;

                tracing::info!(
                    "Stack provisioned: registry {}, cluster {}",
                    handles.registry.uri,
                    handles.cluster.name
                );
                Ok(handles)
            }
            Err(e) => {
                tracing::error!("Provisioning failed: {}", e);
                state.outputs = None;
                state.handles = None;
                self.persist(&state)?;
                Err(e)
            }
        }
    }

    /// Handles from the last provisioning pass, `None` if it failed
    pub fn handles(&self) -> Option<ResourceHandles> {
        self.read().handles.clone()
    }

    /// Stack outputs, `None` until provisioned, after a failed pass and
    /// after teardown
    pub fn outputs(&self) -> Option<StackOutputs> {
        self.read().outputs.clone()
    }

    /// Looks up a resource record
    pub fn resource(&self, kind: ResourceKind, name: &str) -> Option<ResourceRecord> {
        self.read().resources.get(&resource_key(kind, name)).cloned()
    }

    pub fn resources(&self) -> Vec<ResourceRecord> {
        self.read().resources.values().cloned().collect()
    }

    /// Tears the stack down
    ///
    /// `destroy` resources are deleted; `retain` resources stay behind as
    /// orphans that block re-creation under the same name.
    pub fn teardown(&self) -> Result<(), ProvisioningError> {
        let mut state = self.write();

        let records: Vec<ResourceRecord> = state.resources.values().cloned().collect();
        for record in records {
            let key = resource_key(record.kind, &record.name);
            match record.policy {
                RemovalPolicy::Destroy => {
                    state.resources.remove(&key);
                    match record.kind {
                        ResourceKind::Registry => state.ledger.clear_registry(),
                        ResourceKind::Cluster => state.ledger.clear_cluster(),
                        ResourceKind::Secret => state.secrets.remove(&record.name),
                        ResourceKind::Network => {}
                    }
                    tracing::info!("Destroyed {} '{}'", record.kind, record.name);
                }
                RemovalPolicy::Retain => {
                    if let Some(r) = state.resources.get_mut(&key) {
                        r.status = ResourceStatus::Retained;
                    }
                    tracing::info!("Retained {} '{}'", record.kind, record.name);
                }
            }
        }

        state.handles = None;
        state.outputs = None;
        self.persist(&state)
    }

    // =========================================================================
    // Secrets
    // =========================================================================

    /// Sets one key of a secret, e.g. replacing a placeholder
    pub fn rotate_secret(
        &self,
        name: &str,
        key: &str,
        value: impl Into<String>,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.write();
        state.secrets.rotate(name, key, value.into())?;
        self.persist(&state)?;
        tracing::info!("Rotated secret {}:{}", name, key);
        Ok(())
    }

    /// Registers a secret managed outside the stack
    pub fn put_external_secret(
        &self,
        name: &str,
        values: BTreeMap<String, String>,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.write();
        state.secrets.put_external(name, values);
        self.persist(&state)
    }

    /// Key names of a secret
    pub fn secret_keys(&self, name: &str) -> Option<Vec<String>> {
        self.read().secrets.keys(name)
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Records the effects of a finished run against the registry and cluster
    pub fn record_effects(
        &self,
        run_id: Uuid,
        revision: &str,
        effects: &[Effect],
        complete: bool,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.write();
        let registry_uri = state
            .handles
            .as_ref()
            .map(|h| h.registry.uri.clone())
            .ok_or(ProvisioningError::NotProvisioned)?;
        state
            .ledger
            .record(&registry_uri, run_id, revision, effects, complete);
        self.persist(&state)
    }

    pub fn tag(&self, tag: &str) -> Option<TagRecord> {
        self.read().ledger.tag(tag).cloned()
    }

    pub fn deployment_image(&self, deployment: &str, container: &str) -> Option<ImageRef> {
        self.read()
            .ledger
            .deployment_image(deployment, container)
            .cloned()
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.read().ledger.snapshot()
    }
}

impl SecretResolver for ResourceProvisioner {
    fn resolve(&self, reference: &SecretKeyRef) -> Result<SecretValue, FailureCause> {
        self.read()
            .secrets
            .resolve(reference)
            .map_err(FailureCause::from)
    }
}

/// Ensures every declared resource and builds the handles
fn provision_resources(
    state: &mut ProvisionerState,
    config: &StackConfig,
) -> Result<ResourceHandles, ProvisioningError> {
    let resources = &config.resources;

    let network = ensure(
        state,
        ResourceKind::Network,
        &resources.network.name,
        &resources.network,
        resources.network.policy,
    )?;

    let registry = ensure(
        state,
        ResourceKind::Registry,
        &resources.registry.name,
        &resources.registry,
        resources.registry.policy,
    )?;
    if registry.created {
        state.ledger.clear_registry();
    }

    let cluster_spec = ClusterSpec {
        network: &resources.network.name,
        config: &resources.cluster,
    };
    let cluster = ensure(
        state,
        ResourceKind::Cluster,
        &resources.cluster.name,
        &cluster_spec,
        resources.cluster.policy,
    )?;
    if cluster.created {
        state.ledger.clear_cluster();
    }

    let secret = ensure(
        state,
        ResourceKind::Secret,
        &resources.secret.name,
        &resources.secret,
        resources.secret.policy,
    )?;
    if secret.created || !state.secrets.contains(&resources.secret.name) {
        state
            .secrets
            .create(&resources.secret.name, resources.secret.schema());
    }

    let handles = ResourceHandles {
        network: NetworkHandle {
            id: network.id,
            name: resources.network.name.clone(),
            availability_zones: resources.network.availability_zones,
            nat_gateways: resources.network.nat_gateways,
        },
        registry: RegistryHandle {
            id: registry.id,
            name: resources.registry.name.clone(),
            uri: config.registry_uri(),
            policy: resources.registry.policy,
        },
        cluster: ClusterHandle {
            id: cluster.id,
            name: resources.cluster.name.clone(),
            endpoint: config.cluster_endpoint(),
            version: resources.cluster.version.clone(),
        },
        secret: SecretRef::new(&resources.secret.name),
        build_identity: Principal::new(&resources.build.identity),
    };

    Ok(handles)
}

#[derive(Serialize)]
struct ClusterSpec<'a> {
    network: &'a str,
    #[serde(flatten)]
    config: &'a crate::config::ClusterConfig,
}

struct Ensured {
    id: Uuid,
    created: bool,
}

/// Serialized spec without the removal policy
///
/// Changing only the policy updates it in place instead of replacing.
fn spec_of<T: Serialize>(spec: &T) -> Result<serde_json::Value, ProvisioningError> {
    let mut value =
        serde_json::to_value(spec).map_err(|e| ProvisioningError::State(e.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("policy");
    }
    Ok(value)
}

fn ensure<T: Serialize>(
    state: &mut ProvisionerState,
    kind: ResourceKind,
    name: &str,
    spec: &T,
    policy: RemovalPolicy,
) -> Result<Ensured, ProvisioningError> {
    let spec = spec_of(spec)?;
    let key = resource_key(kind, name);

    let generation = match state.resources.get_mut(&key) {
        None => 1,
        Some(existing) if existing.status == ResourceStatus::Retained => {
            return Err(ProvisioningError::AlreadyExists {
                kind,
                name: name.to_string(),
            });
        }
        Some(existing) if existing.spec == spec => {
            existing.policy = policy;
            tracing::debug!("{} '{}' unchanged", kind, name);
            return Ok(Ensured {
                id: existing.id,
                created: false,
            });
        }
        Some(existing) => match existing.policy {
            RemovalPolicy::Retain => {
                return Err(ProvisioningError::AlreadyExists {
                    kind,
                    name: name.to_string(),
                });
            }
            RemovalPolicy::Destroy => {
                tracing::info!("Replacing {} '{}' after spec change", kind, name);
                existing.generation + 1
            }
        },
    };

    let id = Uuid::new_v4();
    state.resources.insert(
        key,
        ResourceRecord {
            id,
            kind,
            name: name.to_string(),
            spec,
            policy,
            generation,
            status: ResourceStatus::Active,
            created_at: Utc::now(),
        },
    );
    if generation == 1 {
        tracing::info!("Created {} '{}'", kind, name);
    }

    Ok(Ensured { id, created: true })
}
