//! Build specification
//!
//! The declarative phase list executed by the build stage. Parsed from YAML
//! into typed structs; unknown phases or keys are rejected instead of being
//! silently ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::domain::binding::{RESERVED_NAMES, is_valid_name};
use crate::domain::secret::SecretKeyRef;
use crate::error::BuildSpecError;

/// Build spec schema versions this implementation understands
pub const SUPPORTED_VERSIONS: &[&str] = &["0.2"];

/// One of the four recognized build phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Install,
    PreBuild,
    Build,
    PostBuild,
}

impl PhaseName {
    /// The fixed execution order
    pub const ORDER: [PhaseName; 4] = [
        PhaseName::Install,
        PhaseName::PreBuild,
        PhaseName::Build,
        PhaseName::PostBuild,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::Install => "install",
            PhaseName::PreBuild => "pre_build",
            PhaseName::Build => "build",
            PhaseName::PostBuild => "post_build",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A YAML scalar that may be written as a string or a number
///
/// `version: 0.2` and `nodejs: 20` are both common spellings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Text(s) => write!(f, "{}", s),
            ScalarValue::Integer(i) => write!(f, "{}", i),
            ScalarValue::Float(x) => write!(f, "{}", x),
            ScalarValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Build specification document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSpec {
    pub version: ScalarValue,
    #[serde(default)]
    pub env: EnvSection,
    pub phases: Phases,
}

/// Explicitly declared environment for the build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvSection {
    /// Plain values
    #[serde(default)]
    pub variables: BTreeMap<String, ScalarValue>,
    /// Secret-backed values as `<secret>:<key>`
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

/// The recognized phases; any other key is an error
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Phases {
    #[serde(default)]
    pub install: Option<PhaseSpec>,
    #[serde(default)]
    pub pre_build: Option<PhaseSpec>,
    #[serde(default)]
    pub build: Option<PhaseSpec>,
    #[serde(default)]
    pub post_build: Option<PhaseSpec>,
}

/// Declared content of a single phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseSpec {
    #[serde(default, rename = "runtime-versions")]
    pub runtime_versions: BTreeMap<String, ScalarValue>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// A phase ready for execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPhase {
    pub name: PhaseName,
    pub commands: Vec<String>,
    pub runtime_versions: BTreeMap<String, String>,
}

impl BuildPhase {
    pub fn new(name: PhaseName, commands: Vec<String>) -> Self {
        Self {
            name,
            commands,
            runtime_versions: BTreeMap::new(),
        }
    }
}

impl Phases {
    fn get(&self, name: PhaseName) -> Option<&PhaseSpec> {
        match name {
            PhaseName::Install => self.install.as_ref(),
            PhaseName::PreBuild => self.pre_build.as_ref(),
            PhaseName::Build => self.build.as_ref(),
            PhaseName::PostBuild => self.post_build.as_ref(),
        }
    }
}

impl BuildSpec {
    /// Parses and validates a build spec from YAML text
    pub fn from_yaml(text: &str) -> Result<Self, BuildSpecError> {
        let spec: BuildSpec = serde_yaml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Reads, parses and validates a build spec file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BuildSpecError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Validates version, commands and declared environment
    pub fn validate(&self) -> Result<(), BuildSpecError> {
        let version = self.version.to_string();
        if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
            return Err(BuildSpecError::UnsupportedVersion(version));
        }

        for phase in PhaseName::ORDER {
            if let Some(spec) = self.phases.get(phase) {
                for (index, command) in spec.commands.iter().enumerate() {
                    if command.trim().is_empty() {
                        return Err(BuildSpecError::EmptyCommand { phase, index });
                    }
                }
            }
        }

        for name in self.env.variables.keys().chain(self.env.secrets.keys()) {
            if !is_valid_name(name) {
                return Err(BuildSpecError::InvalidVariableName(name.clone()));
            }
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(BuildSpecError::ReservedVariable(name.clone()));
            }
        }

        for (name, reference) in &self.env.secrets {
            if self.env.variables.contains_key(name) {
                return Err(BuildSpecError::DuplicateVariable(name.clone()));
            }
            if SecretKeyRef::parse(reference).is_none() {
                return Err(BuildSpecError::InvalidSecretReference(reference.clone()));
            }
        }

        Ok(())
    }

    /// All four phases in execution order; undeclared phases are empty
    pub fn phases(&self) -> Vec<BuildPhase> {
        PhaseName::ORDER
            .iter()
            .map(|&name| match self.phases.get(name) {
                Some(spec) => BuildPhase {
                    name,
                    commands: spec.commands.clone(),
                    runtime_versions: spec
                        .runtime_versions
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_string()))
                        .collect(),
                },
                None => BuildPhase::new(name, Vec::new()),
            })
            .collect()
    }

    /// Declared plain variables rendered as strings
    pub fn declared_variables(&self) -> BTreeMap<String, String> {
        self.env
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }

    /// Declared secret-backed variables
    pub fn declared_secrets(&self) -> BTreeMap<String, SecretKeyRef> {
        self.env
            .secrets
            .iter()
            .filter_map(|(k, v)| SecretKeyRef::parse(v).map(|r| (k.clone(), r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MICROSERVICE_SPEC: &str = r#"
version: 0.2
env:
  variables:
    AWS_DEFAULT_REGION: us-east-1
    AWS_ACCOUNT_ID: "123456789012"
phases:
  install:
    runtime-versions:
      nodejs: 20
  pre_build:
    commands:
      - echo Logging in to the registry...
      - aws ecr get-login-password --region $AWS_DEFAULT_REGION | docker login --username AWS --password-stdin $AWS_ACCOUNT_ID.dkr.ecr.$AWS_DEFAULT_REGION.amazonaws.com
  build:
    commands:
      - docker build -t $REPOSITORY_URI:latest .
      - docker tag $REPOSITORY_URI:latest $REPOSITORY_URI:$RESOLVED_SOURCE_VERSION
  post_build:
    commands:
      - docker push $REPOSITORY_URI:latest
      - docker push $REPOSITORY_URI:$RESOLVED_SOURCE_VERSION
      - kubectl set image deployment/data-microservice microservice=$REPOSITORY_URI:$RESOLVED_SOURCE_VERSION
"#;

    #[test]
    fn test_parse_microservice_spec() {
        let spec = BuildSpec::from_yaml(MICROSERVICE_SPEC).unwrap();
        let phases = spec.phases();

        assert_eq!(
            phases.iter().map(|p| p.name).collect::<Vec<_>>(),
            PhaseName::ORDER.to_vec()
        );
        assert!(phases[0].commands.is_empty());
        assert_eq!(phases[0].runtime_versions.get("nodejs"), Some(&"20".to_string()));
        assert_eq!(phases[1].commands.len(), 2);
        assert_eq!(phases[3].commands.len(), 3);
        assert_eq!(
            spec.declared_variables().get("AWS_ACCOUNT_ID"),
            Some(&"123456789012".to_string())
        );
    }

    #[test]
    fn test_unknown_phase_rejected() {
        let yaml = r#"
version: 0.2
phases:
  deploy:
    commands: ["kubectl apply -f deployment.yaml"]
"#;
        let err = BuildSpec::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, BuildSpecError::Parse(_)));
        assert!(err.to_string().contains("deploy"));
    }

    #[test]
    fn test_unknown_phase_key_rejected() {
        let yaml = r#"
version: 0.2
phases:
  build:
    command: ["make"]
"#;
        assert!(matches!(
            BuildSpec::from_yaml(yaml),
            Err(BuildSpecError::Parse(_))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let yaml = "version: 0.1\nphases: {}\n";
        match BuildSpec::from_yaml(yaml) {
            Err(BuildSpecError::UnsupportedVersion(v)) => assert_eq!(v, "0.1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_string_version_accepted() {
        let yaml = "version: \"0.2\"\nphases: {}\n";
        let spec = BuildSpec::from_yaml(yaml).unwrap();
        assert!(spec.phases().iter().all(|p| p.commands.is_empty()));
    }

    #[test]
    fn test_empty_command_rejected() {
        let yaml = r#"
version: 0.2
phases:
  build:
    commands: ["make", "  "]
"#;
        assert!(matches!(
            BuildSpec::from_yaml(yaml),
            Err(BuildSpecError::EmptyCommand {
                phase: PhaseName::Build,
                index: 1
            })
        ));
    }

    #[test]
    fn test_reserved_variable_rejected() {
        let yaml = r#"
version: 0.2
env:
  variables:
    REPOSITORY_URI: somewhere-else
phases: {}
"#;
        assert!(matches!(
            BuildSpec::from_yaml(yaml),
            Err(BuildSpecError::ReservedVariable(_))
        ));
    }

    #[test]
    fn test_secret_references() {
        let yaml = r#"
version: 0.2
env:
  secrets:
    DATABASE_URL: microservice-config:DATABASE_URL
phases: {}
"#;
        let spec = BuildSpec::from_yaml(yaml).unwrap();
        let secrets = spec.declared_secrets();
        let reference = secrets.get("DATABASE_URL").unwrap();
        assert_eq!(reference.secret, "microservice-config");
        assert_eq!(reference.key, "DATABASE_URL");

        let bad = yaml.replace("microservice-config:DATABASE_URL", "no-key-here");
        assert!(matches!(
            BuildSpec::from_yaml(&bad),
            Err(BuildSpecError::InvalidSecretReference(_))
        ));
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let yaml = r#"
version: 0.2
env:
  variables:
    DATABASE_URL: plain
  secrets:
    DATABASE_URL: microservice-config:DATABASE_URL
phases: {}
"#;
        assert!(matches!(
            BuildSpec::from_yaml(yaml),
            Err(BuildSpecError::DuplicateVariable(_))
        ));
    }

    #[test]
    fn test_sample_buildspec_file() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/buildspec.yml");
        let spec = BuildSpec::from_file(path).unwrap();

        let phases = spec.phases();
        assert_eq!(phases[0].runtime_versions.get("nodejs").map(String::as_str), Some("20"));
        assert!(phases[0].commands.is_empty());
        assert_eq!(phases[3].commands.len(), 5);
        assert_eq!(
            spec.declared_variables().get("AWS_ACCOUNT_ID").map(String::as_str),
            Some("123456789012")
        );
    }
}
