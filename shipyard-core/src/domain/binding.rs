//! Environment binding
//!
//! Maps symbolic names referenced by build commands (`$NAME` or `${NAME}`)
//! to values injected into the build at stage start. Secret-backed entries
//! stay references until the runner resolves them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::domain::secret::{SecretKeyRef, SecretResolver};
use crate::error::FailureCause;

/// Registry URI of the provisioned repository
pub const REGISTRY_URI: &str = "REPOSITORY_URI";
/// Name of the provisioned cluster
pub const CLUSTER_NAME: &str = "CLUSTER_NAME";
/// Source revision being built
pub const SOURCE_REVISION: &str = "RESOLVED_SOURCE_VERSION";

/// Names the pipeline always provides; build specs may not redeclare them
pub const RESERVED_NAMES: &[&str] = &[REGISTRY_URI, CLUSTER_NAME, SOURCE_REVISION];

/// Matches `${NAME}` (group 1) or `$NAME` (group 2).
/// `$(...)` command substitution and `$1` positional parameters do not match.
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("Invalid regex pattern")
});

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex pattern"));

/// Whether `name` is a valid environment variable name
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Names referenced by a command, in order of first appearance
pub fn referenced_names(command: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in REFERENCE_PATTERN.captures_iter(command) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            let name = m.as_str();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// A bound value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BindingValue {
    Plain(String),
    Secret(SecretKeyRef),
}

/// Symbolic name to value mapping for one build execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentBinding {
    values: BTreeMap<String, BindingValue>,
}

impl EnvironmentBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binding with the three values every build may rely on
    pub fn builtin(registry_uri: &str, cluster_name: &str, revision: &str) -> Self {
        let mut binding = Self::new();
        binding.insert(REGISTRY_URI, registry_uri);
        binding.insert(CLUSTER_NAME, cluster_name);
        binding.insert(SOURCE_REVISION, revision);
        binding
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(name.into(), BindingValue::Plain(value.into()));
    }

    pub fn insert_secret(&mut self, name: impl Into<String>, reference: SecretKeyRef) {
        self.values
            .insert(name.into(), BindingValue::Secret(reference));
    }

    pub fn get(&self, name: &str) -> Option<&BindingValue> {
        self.values.get(name)
    }

    /// Plain value for a name, if bound to one
    pub fn plain(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(BindingValue::Plain(v)) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Secret references held by this binding
    pub fn secret_refs(&self) -> impl Iterator<Item = (&str, &SecretKeyRef)> {
        self.values.iter().filter_map(|(k, v)| match v {
            BindingValue::Secret(r) => Some((k.as_str(), r)),
            BindingValue::Plain(_) => None,
        })
    }

    /// First name referenced by `command` that is not bound
    pub fn first_missing(&self, command: &str) -> Option<String> {
        referenced_names(command)
            .into_iter()
            .find(|name| !self.contains(name))
    }

    /// Substitutes plain values; secret references become `****`
    ///
    /// Unbound references are left untouched.
    pub fn expand_plain(&self, command: &str) -> String {
        REFERENCE_PATTERN
            .replace_all(command, |caps: &regex::Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or("");
                match self.values.get(name) {
                    Some(BindingValue::Plain(v)) => v.clone(),
                    Some(BindingValue::Secret(_)) => "****".to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Resolves every entry to a concrete value for the execution environment
    pub fn resolve(
        &self,
        secrets: &dyn SecretResolver,
    ) -> Result<BTreeMap<String, String>, FailureCause> {
        let mut env = BTreeMap::new();
        for (name, value) in &self.values {
            let resolved = match value {
                BindingValue::Plain(v) => v.clone(),
                BindingValue::Secret(r) => secrets.resolve(r)?.expose().to_string(),
            };
            env.insert(name.clone(), resolved);
        }
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::secret::SecretValue;

    struct FixedSecrets;

    impl SecretResolver for FixedSecrets {
        fn resolve(&self, reference: &SecretKeyRef) -> Result<SecretValue, FailureCause> {
            if reference.key == "DATABASE_URL" {
                Ok(SecretValue::new("postgres://db"))
            } else {
                Err(FailureCause::Provisioning {
                    message: format!("no key {}", reference.key),
                })
            }
        }
    }

    #[test]
    fn test_referenced_names() {
        let names = referenced_names(
            "docker tag $REPOSITORY_URI:latest ${REPOSITORY_URI}:$RESOLVED_SOURCE_VERSION",
        );
        assert_eq!(names, vec!["REPOSITORY_URI", "RESOLVED_SOURCE_VERSION"]);
    }

    #[test]
    fn test_command_substitution_is_not_a_reference() {
        assert!(referenced_names("echo Build started on $(date) `date` $1").is_empty());
    }

    #[test]
    fn test_builtin_binding() {
        let binding = EnvironmentBinding::builtin("registry/app", "cluster", "abc123");
        assert_eq!(binding.plain(REGISTRY_URI), Some("registry/app"));
        assert_eq!(binding.plain(CLUSTER_NAME), Some("cluster"));
        assert_eq!(binding.plain(SOURCE_REVISION), Some("abc123"));
        assert_eq!(binding.len(), 3);
    }

    #[test]
    fn test_first_missing() {
        let binding = EnvironmentBinding::builtin("registry/app", "cluster", "abc123");
        assert_eq!(
            binding.first_missing("aws eks update-kubeconfig --name $CLUSTER_NAME --region $AWS_DEFAULT_REGION"),
            Some("AWS_DEFAULT_REGION".to_string())
        );
        assert_eq!(binding.first_missing("docker push $REPOSITORY_URI:latest"), None);
    }

    #[test]
    fn test_expand_plain_masks_secrets() {
        let mut binding = EnvironmentBinding::builtin("registry/app", "cluster", "abc123");
        binding.insert_secret(
            "DATABASE_URL",
            SecretKeyRef::parse("config:DATABASE_URL").unwrap(),
        );

        assert_eq!(
            binding.expand_plain("docker push ${REPOSITORY_URI}:$RESOLVED_SOURCE_VERSION"),
            "docker push registry/app:abc123"
        );
        assert_eq!(binding.expand_plain("echo $DATABASE_URL"), "echo ****");
        assert_eq!(binding.expand_plain("echo $UNBOUND"), "echo $UNBOUND");
    }

    #[test]
    fn test_resolve() {
        let mut binding = EnvironmentBinding::builtin("registry/app", "cluster", "abc123");
        binding.insert_secret(
            "DATABASE_URL",
            SecretKeyRef::parse("config:DATABASE_URL").unwrap(),
        );
        let env = binding.resolve(&FixedSecrets).unwrap();
        assert_eq!(env.get("DATABASE_URL"), Some(&"postgres://db".to_string()));
        assert_eq!(env.get(SOURCE_REVISION), Some(&"abc123".to_string()));

        binding.insert_secret("REDIS_URL", SecretKeyRef::parse("config:REDIS_URL").unwrap());
        assert!(binding.resolve(&FixedSecrets).is_err());
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("AWS_DEFAULT_REGION"));
        assert!(is_valid_name("_private"));
        assert!(!is_valid_name("1ABC"));
        assert!(!is_valid_name("WITH-DASH"));
        assert!(!is_valid_name(""));
    }
}
