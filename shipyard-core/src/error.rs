//! Error types shared across Shipyard components

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::buildspec::PhaseName;
use crate::domain::grant::{Capability, Principal, ResourceKind, ResourceRef};
use crate::domain::stage::StageName;

/// Why a stage or build phase failed
///
/// This is the diagnostic stored on run records, so it must stay
/// serializable and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// A resource could not be created or conflicts with an existing one
    #[error("provisioning failed: {message}")]
    Provisioning { message: String },

    /// The principal lacks the capability, or the credential was rejected
    #[error("{principal} is not authorized to {capability} on {resource}{}", detail_suffix(.detail))]
    Authorization {
        principal: Principal,
        resource: ResourceRef,
        capability: Capability,
        detail: Option<String>,
    },

    /// The external source could not be reached or authenticated
    #[error("source unavailable: {message}")]
    SourceUnavailable { message: String },

    /// A command exited unsuccessfully
    #[error("command `{command}` failed{}{}", exit_suffix(.exit_code), detail_suffix(.detail))]
    PhaseExecution {
        command: String,
        exit_code: Option<i32>,
        detail: Option<String>,
    },

    /// A referenced environment value is absent from the binding
    #[error("environment binding `{name}` is not set")]
    BindingMissing { name: String },

    /// All phases passed but a required external effect never happened
    #[error("build finished without {effect}")]
    EffectMissing { effect: String },
}

impl FailureCause {
    /// Short taxonomy label used in summaries
    pub fn label(&self) -> &'static str {
        match self {
            FailureCause::Provisioning { .. } => "ProvisioningError",
            FailureCause::Authorization { .. } => "AuthorizationError",
            FailureCause::SourceUnavailable { .. } => "SourceUnavailable",
            FailureCause::PhaseExecution { .. } => "PhaseExecutionError",
            FailureCause::BindingMissing { .. } => "BindingMissingError",
            FailureCause::EffectMissing { .. } => "EffectMissingError",
        }
    }

    /// Authorization failure for a missing grant
    pub fn unauthorized(
        principal: &Principal,
        resource: &ResourceRef,
        capability: Capability,
    ) -> Self {
        FailureCause::Authorization {
            principal: principal.clone(),
            resource: resource.clone(),
            capability,
            detail: None,
        }
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) if !d.is_empty() => format!(": {}", d),
        _ => String::new(),
    }
}

fn exit_suffix(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!(" with exit code {}", code),
        None => " to start".to_string(),
    }
}

/// Errors raised while creating resources or grants
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("capability {capability} cannot be granted on {resource}")]
    InvalidGrant {
        resource: ResourceRef,
        capability: Capability,
    },

    #[error("stack has not been provisioned")]
    NotProvisioned,

    #[error("secret '{0}' does not exist")]
    UnknownSecret(String),

    #[error("secret '{secret}' has no key '{key}'")]
    UnknownSecretKey { secret: String, key: String },

    #[error("failed to read stack file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse stack file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("provisioning state error: {0}")]
    State(String),
}

impl From<ProvisioningError> for FailureCause {
    fn from(err: ProvisioningError) -> Self {
        FailureCause::Provisioning {
            message: err.to_string(),
        }
    }
}

/// Errors raised while loading a build spec
#[derive(Debug, Error)]
pub enum BuildSpecError {
    #[error("failed to read build spec: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse build spec: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported build spec version '{0}'")]
    UnsupportedVersion(String),

    #[error("command #{index} in phase {phase} is empty")]
    EmptyCommand { phase: PhaseName, index: usize },

    #[error("invalid environment variable name '{0}'")]
    InvalidVariableName(String),

    #[error("variable '{0}' is declared more than once")]
    DuplicateVariable(String),

    #[error("variable '{0}' is reserved for the pipeline")]
    ReservedVariable(String),

    #[error("invalid secret reference '{0}' (expected '<secret>:<key>')")]
    InvalidSecretReference(String),
}

/// Errors raised while validating a stage graph
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageGraphError {
    #[error("pipeline must have exactly the stages Source then Build, found {0:?}")]
    UnexpectedShape(Vec<StageName>),

    #[error("stage {stage} consumes '{artifact}' which no earlier stage produces")]
    ArtifactNotYetProduced { stage: StageName, artifact: String },

    #[error("artifact '{0}' is produced more than once")]
    DuplicateArtifact(String),

    #[error("stage {0} has no actions")]
    EmptyStage(StageName),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_display() {
        let cause = FailureCause::Authorization {
            principal: Principal::new("build-role"),
            resource: ResourceRef::registry("node-data-microservice"),
            capability: Capability::Push,
            detail: None,
        };
        assert_eq!(
            cause.to_string(),
            "build-role is not authorized to push on registry/node-data-microservice"
        );
        assert_eq!(cause.label(), "AuthorizationError");
    }

    #[test]
    fn test_phase_execution_display() {
        let cause = FailureCause::PhaseExecution {
            command: "kubectl set image".to_string(),
            exit_code: Some(1),
            detail: Some("not found".to_string()),
        };
        assert_eq!(
            cause.to_string(),
            "command `kubectl set image` failed with exit code 1: not found"
        );

        let spawn = FailureCause::PhaseExecution {
            command: "make".to_string(),
            exit_code: None,
            detail: None,
        };
        assert_eq!(spawn.to_string(), "command `make` failed to start");
    }

    #[test]
    fn test_failure_cause_serde_tag() {
        let cause = FailureCause::BindingMissing {
            name: "CLUSTER_NAME".to_string(),
        };
        let json = serde_json::to_value(&cause).unwrap();
        assert_eq!(json["kind"], "binding_missing");
        let back: FailureCause = serde_json::from_value(json).unwrap();
        assert_eq!(back, cause);
    }
}
