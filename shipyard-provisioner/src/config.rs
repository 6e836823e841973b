//! Stack configuration
//!
//! Declarative description of the resources the provisioner creates and the
//! pipeline wired on top of them. Loaded from a YAML stack file; every field
//! has a default matching the reference microservice stack.

use serde::{Deserialize, Serialize};
use std::path::Path;

use shipyard_core::ProvisioningError;
use shipyard_core::domain::resource::RemovalPolicy;
use shipyard_core::domain::secret::SecretSchema;

/// Top-level stack file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Cloud account identifier
    #[serde(default = "default_account")]
    pub account: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Domain suffix for registry URIs
    #[serde(default = "default_registry_domain")]
    pub registry_domain: String,

    /// Domain suffix for cluster endpoints
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_account() -> String {
    "123456789012".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_registry_domain() -> String {
    "amazonaws.com".to_string()
}

fn default_cluster_domain() -> String {
    "eks.amazonaws.com".to_string()
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            account: default_account(),
            region: default_region(),
            registry_domain: default_registry_domain(),
            cluster_domain: default_cluster_domain(),
            resources: ResourcesConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Resources owned by the provisioner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub secret: SecretConfig,
    #[serde(default)]
    pub build: BuildProjectConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkConfig {
    pub name: String,
    pub availability_zones: u32,
    pub nat_gateways: u32,
    pub policy: RemovalPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "microservice-vpc".to_string(),
            availability_zones: 2,
            nat_gateways: 1,
            policy: RemovalPolicy::Destroy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegistryConfig {
    /// Repository name, also the registry's logical name
    pub name: String,
    pub policy: RemovalPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "node-data-microservice".to_string(),
            policy: RemovalPolicy::Destroy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterConfig {
    pub name: String,
    /// Kubernetes version
    pub version: String,
    pub instance_type: String,
    pub desired_capacity: u32,
    pub policy: RemovalPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "microservice-cluster".to_string(),
            version: "1.27".to_string(),
            instance_type: "t3.medium".to_string(),
            desired_capacity: 2,
            policy: RemovalPolicy::Destroy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SecretConfig {
    pub name: String,
    /// Keys populated externally, `placeholder` until rotated
    pub keys: Vec<String>,
    /// Key filled with a generated value
    pub generated_key: Option<String>,
    pub policy: RemovalPolicy,
}

impl SecretConfig {
    pub fn schema(&self) -> SecretSchema {
        SecretSchema {
            required_keys: self.keys.clone(),
            generated_key: self.generated_key.clone(),
        }
    }
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            name: "microservice-config".to_string(),
            keys: vec!["DATABASE_URL".to_string(), "REDIS_URL".to_string()],
            generated_key: Some("generated".to_string()),
            policy: RemovalPolicy::Destroy,
        }
    }
}

/// Build project environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildProjectConfig {
    pub name: String,
    /// Container image the build runs in
    pub image: String,
    /// Whether the build container may run a docker daemon
    pub privileged: bool,
    /// Execution identity of the build
    pub identity: String,
}

impl Default for BuildProjectConfig {
    fn default() -> Self {
        Self {
            name: "microservice-build".to_string(),
            image: "aws/codebuild/standard:7.0".to_string(),
            privileged: true,
            identity: "microservice-build-role".to_string(),
        }
    }
}

/// Pipeline wiring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub name: String,
    /// Only changes on this branch trigger runs
    pub branch: String,
    pub source: SourceConfig,
    /// Build spec path, relative to the source checkout
    pub buildspec: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "microservice-pipeline".to_string(),
            branch: "main".to_string(),
            source: SourceConfig::default(),
            buildspec: "buildspec.yml".to_string(),
        }
    }
}

/// Source repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SourceConfig {
    pub owner: String,
    pub repo: String,
    /// Clone URL override; derived from owner/repo when unset
    pub url: Option<String>,
    /// Secret holding the access token, resolved only at fetch time
    pub token_secret: Option<String>,
}

impl SourceConfig {
    pub fn clone_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("https://github.com/{}/{}.git", self.owner, self.repo),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            owner: "seu-usuario".to_string(),
            repo: "microservice-repo".to_string(),
            url: None,
            token_secret: Some("github-token".to_string()),
        }
    }
}

impl StackConfig {
    /// Parses and validates a stack from YAML text
    pub fn from_yaml(text: &str) -> Result<Self, ProvisioningError> {
        let config: StackConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a stack file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProvisioningError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ProvisioningError> {
        let invalid = |msg: &str| Err(ProvisioningError::InvalidConfig(msg.to_string()));

        if self.account.is_empty() {
            return invalid("account cannot be empty");
        }
        if self.region.is_empty() {
            return invalid("region cannot be empty");
        }

        let resources = &self.resources;
        if resources.network.availability_zones == 0 {
            return invalid("network.availability_zones must be greater than 0");
        }
        if resources.network.nat_gateways > resources.network.availability_zones {
            return invalid("network.nat_gateways cannot exceed availability_zones");
        }
        if resources.registry.name.is_empty() {
            return invalid("registry.name cannot be empty");
        }
        if resources.cluster.name.is_empty() {
            return invalid("cluster.name cannot be empty");
        }
        if resources.cluster.desired_capacity == 0 {
            return invalid("cluster.desired_capacity must be greater than 0");
        }
        if resources.secret.name.is_empty() {
            return invalid("secret.name cannot be empty");
        }
        if let Some(generated) = &resources.secret.generated_key
            && resources.secret.keys.contains(generated)
        {
            return invalid("secret.generated_key must not repeat a schema key");
        }
        if resources.build.identity.is_empty() {
            return invalid("build.identity cannot be empty");
        }
        if self.pipeline.branch.is_empty() {
            return invalid("pipeline.branch cannot be empty");
        }
        if self.pipeline.buildspec.is_empty() {
            return invalid("pipeline.buildspec cannot be empty");
        }

        Ok(())
    }

    /// `<account>.dkr.ecr.<region>.<domain>/<repository>`
    pub fn registry_uri(&self) -> String {
        format!(
            "{}.dkr.ecr.{}.{}/{}",
            self.account, self.region, self.registry_domain, self.resources.registry.name
        )
    }

    /// `https://<cluster>.<region>.<domain>`
    pub fn cluster_endpoint(&self) -> String {
        format!(
            "https://{}.{}.{}",
            self.resources.cluster.name, self.region, self.cluster_domain
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stack() {
        let config = StackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resources.network.availability_zones, 2);
        assert_eq!(config.resources.network.nat_gateways, 1);
        assert_eq!(config.resources.registry.name, "node-data-microservice");
        assert_eq!(config.resources.registry.policy, RemovalPolicy::Destroy);
        assert_eq!(config.resources.cluster.version, "1.27");
        assert_eq!(config.resources.cluster.desired_capacity, 2);
        assert_eq!(config.resources.secret.keys, vec!["DATABASE_URL", "REDIS_URL"]);
        assert!(config.resources.build.privileged);
        assert_eq!(config.pipeline.branch, "main");
    }

    #[test]
    fn test_registry_uri_and_endpoint() {
        let config = StackConfig::default();
        assert_eq!(
            config.registry_uri(),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/node-data-microservice"
        );
        assert_eq!(
            config.cluster_endpoint(),
            "https://microservice-cluster.us-east-1.eks.amazonaws.com"
        );
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
account: "999999999999"
region: eu-west-1
resources:
  registry:
    name: orders
    policy: retain
pipeline:
  branch: release
"#;
        let config = StackConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.resources.registry.name, "orders");
        assert_eq!(config.resources.registry.policy, RemovalPolicy::Retain);
        assert_eq!(config.resources.cluster.name, "microservice-cluster");
        assert_eq!(config.pipeline.branch, "release");
        assert_eq!(config.pipeline.buildspec, "buildspec.yml");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let yaml = "resources:\n  registry:\n    repository: orders\n";
        assert!(matches!(
            StackConfig::from_yaml(yaml),
            Err(ProvisioningError::Yaml(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = StackConfig::default();
        config.resources.network.nat_gateways = 3;
        assert!(matches!(
            config.validate(),
            Err(ProvisioningError::InvalidConfig(_))
        ));

        let mut config = StackConfig::default();
        config.resources.secret.generated_key = Some("REDIS_URL".to_string());
        assert!(config.validate().is_err());

        let mut config = StackConfig::default();
        config.pipeline.branch = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reference_stack_file_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/stack.yml");
        let config = StackConfig::from_file(path).unwrap();
        let defaults = StackConfig::default();

        assert_eq!(config.account, defaults.account);
        assert_eq!(config.region, defaults.region);
        assert_eq!(config.resources.network, defaults.resources.network);
        assert_eq!(config.resources.registry, defaults.resources.registry);
        assert_eq!(config.resources.cluster, defaults.resources.cluster);
        assert_eq!(config.resources.secret, defaults.resources.secret);
        assert_eq!(config.resources.build, defaults.resources.build);
        assert_eq!(config.pipeline, defaults.pipeline);
    }

    #[test]
    fn test_source_clone_url() {
        let mut source = SourceConfig::default();
        assert_eq!(
            source.clone_url(),
            "https://github.com/seu-usuario/microservice-repo.git"
        );
        source.url = Some("file:///srv/git/app".to_string());
        assert_eq!(source.clone_url(), "file:///srv/git/app");
    }
}
