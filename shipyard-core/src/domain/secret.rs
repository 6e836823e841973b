//! Secret domain types
//!
//! Consumers hold a `SecretRef` or `SecretKeyRef`; the value only appears at
//! resolution time, wrapped in `SecretValue` so it never leaks through Debug.

use serde::{Deserialize, Serialize};

use crate::error::FailureCause;

/// Reference to a secret by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
}

impl SecretRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn key(&self, key: impl Into<String>) -> SecretKeyRef {
        SecretKeyRef {
            secret: self.name.clone(),
            key: key.into(),
        }
    }
}

/// Reference to a single key inside a secret
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub secret: String,
    pub key: String,
}

impl SecretKeyRef {
    /// Parses `<secret>:<key>`
    pub fn parse(reference: &str) -> Option<Self> {
        let (secret, key) = reference.split_once(':')?;
        if secret.is_empty() || key.is_empty() || key.contains(':') {
            return None;
        }
        Some(Self {
            secret: secret.to_string(),
            key: key.to_string(),
        })
    }
}

impl std::fmt::Display for SecretKeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.secret, self.key)
    }
}

/// Fixed schema of a secret's keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSchema {
    /// Keys populated externally; `placeholder` until rotated
    pub required_keys: Vec<String>,
    /// Key filled with a generated random value, if any
    pub generated_key: Option<String>,
}

impl SecretSchema {
    pub fn contains(&self, key: &str) -> bool {
        self.required_keys.iter().any(|k| k == key) || self.generated_key.as_deref() == Some(key)
    }
}

/// A resolved secret value
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretValue(****)")
    }
}

/// Resolves secret references at execution time
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, reference: &SecretKeyRef) -> Result<SecretValue, FailureCause>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_ref() {
        let r = SecretKeyRef::parse("microservice-config:REDIS_URL").unwrap();
        assert_eq!(r.secret, "microservice-config");
        assert_eq!(r.key, "REDIS_URL");
        assert_eq!(r.to_string(), "microservice-config:REDIS_URL");

        assert!(SecretKeyRef::parse("no-separator").is_none());
        assert!(SecretKeyRef::parse(":key").is_none());
        assert!(SecretKeyRef::parse("secret:").is_none());
        assert!(SecretKeyRef::parse("a:b:c").is_none());
    }

    #[test]
    fn test_secret_value_debug_is_redacted() {
        let value = SecretValue::new("postgres://user:pass@db");
        assert_eq!(format!("{:?}", value), "SecretValue(****)");
        assert_eq!(value.expose(), "postgres://user:pass@db");
    }

    #[test]
    fn test_schema_contains() {
        let schema = SecretSchema {
            required_keys: vec!["DATABASE_URL".to_string(), "REDIS_URL".to_string()],
            generated_key: Some("generated".to_string()),
        };
        assert!(schema.contains("REDIS_URL"));
        assert!(schema.contains("generated"));
        assert!(!schema.contains("API_KEY"));
    }
}
