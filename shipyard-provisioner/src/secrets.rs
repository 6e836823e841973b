//! Secret store
//!
//! Holds secret values by name. Provisioned secrets follow a fixed schema;
//! external secrets (such as the source token) are registered as-is and
//! survive teardown.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use shipyard_core::ProvisioningError;
use shipyard_core::domain::secret::{SecretKeyRef, SecretSchema, SecretValue};

/// Value every schema key starts with until rotated
pub const PLACEHOLDER: &str = "placeholder";

/// Key used when an external secret is a single opaque value
pub const DEFAULT_KEY: &str = "value";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSecret {
    schema: Option<SecretSchema>,
    values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretStore {
    secrets: BTreeMap<String, StoredSecret>,
}

impl SecretStore {
    /// Creates (or recreates) a schema secret with placeholder values
    pub fn create(&mut self, name: &str, schema: SecretSchema) {
        let mut values: BTreeMap<String, String> = schema
            .required_keys
            .iter()
            .map(|k| (k.clone(), PLACEHOLDER.to_string()))
            .collect();
        if let Some(generated) = &schema.generated_key {
            values.insert(generated.clone(), generate_value());
        }
        self.secrets.insert(
            name.to_string(),
            StoredSecret {
                schema: Some(schema),
                values,
            },
        );
    }

    /// Registers a secret managed outside the stack
    pub fn put_external(&mut self, name: &str, values: BTreeMap<String, String>) {
        self.secrets.insert(
            name.to_string(),
            StoredSecret {
                schema: None,
                values,
            },
        );
    }

    /// Sets a key of an existing secret; schema secrets only accept schema keys
    pub fn rotate(&mut self, name: &str, key: &str, value: String) -> Result<(), ProvisioningError> {
        let secret = self
            .secrets
            .get_mut(name)
            .ok_or_else(|| ProvisioningError::UnknownSecret(name.to_string()))?;

        if let Some(schema) = &secret.schema
            && !schema.contains(key)
        {
            return Err(ProvisioningError::UnknownSecretKey {
                secret: name.to_string(),
                key: key.to_string(),
            });
        }

        secret.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) {
        self.secrets.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    /// Key names of a secret, never values
    pub fn keys(&self, name: &str) -> Option<Vec<String>> {
        self.secrets
            .get(name)
            .map(|s| s.values.keys().cloned().collect())
    }

    pub fn resolve(&self, reference: &SecretKeyRef) -> Result<SecretValue, ProvisioningError> {
        let secret = self
            .secrets
            .get(&reference.secret)
            .ok_or_else(|| ProvisioningError::UnknownSecret(reference.secret.clone()))?;
        secret
            .values
            .get(&reference.key)
            .map(|v| SecretValue::new(v.clone()))
            .ok_or_else(|| ProvisioningError::UnknownSecretKey {
                secret: reference.secret.clone(),
                key: reference.key.clone(),
            })
    }
}

fn generate_value() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
