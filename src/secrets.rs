//! Secret store seam.
//!
//! The core never holds raw API keys at rest, only secret names. Resolution
//! happens at dispatch time through this trait so deployments can back it
//! with env vars, files, or a real KMS.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::models::Provider;

pub trait SecretStore: Send + Sync {
    /// Whether the named secret exists (and, when asked, can be resolved to
    /// a usable plaintext value).
    fn has_key(&self, name: &str, require_decryptable: bool) -> bool;

    /// Resolve a secret name to its plaintext value.
    fn get_decrypted_key(&self, name: &str) -> Result<String>;
}

/// Environment-backed store, the default in every deployment we run.
///
/// Looks up secret names verbatim as environment variables.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn has_key(&self, name: &str, require_decryptable: bool) -> bool {
        match std::env::var(name) {
            Ok(v) => !require_decryptable || !v.trim().is_empty(),
            Err(_) => false,
        }
    }

    fn get_decrypted_key(&self, name: &str) -> Result<String> {
        let value = std::env::var(name)?;
        if value.trim().is_empty() {
            bail!("secret {name} is empty");
        }
        Ok(value)
    }
}

/// In-memory store for tests and local tooling.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn has_key(&self, name: &str, require_decryptable: bool) -> bool {
        match self.secrets.get(name) {
            Some(v) => !require_decryptable || !v.trim().is_empty(),
            None => false,
        }
    }

    fn get_decrypted_key(&self, name: &str) -> Result<String> {
        match self.secrets.get(name) {
            Some(v) if !v.trim().is_empty() => Ok(v.clone()),
            Some(_) => bail!("secret {name} is empty"),
            None => bail!("secret {name} not found"),
        }
    }
}

/// Enumerate the secret names registered for a provider: the base env name
/// plus indexed variants (`_2`, `_3`, ...) until the first gap.
pub fn registered_key_names(store: &dyn SecretStore, provider: Provider) -> Vec<String> {
    let base = provider.env_key_name();
    let mut names = Vec::new();

    if store.has_key(base, true) {
        names.push(base.to_string());
    }

    for idx in 2.. {
        let name = format!("{base}_{idx}");
        if store.has_key(&name, true) {
            names.push(name);
        } else {
            break;
        }
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_store_roundtrip() {
        let store = StaticSecretStore::new().with_secret("DEEPSEEK_API_KEY", "sk-test");
        assert!(store.has_key("DEEPSEEK_API_KEY", true));
        assert!(!store.has_key("QWEN_API_KEY", false));
        assert_eq!(store.get_decrypted_key("DEEPSEEK_API_KEY").unwrap(), "sk-test");
        assert!(store.get_decrypted_key("QWEN_API_KEY").is_err());
    }

    #[test]
    fn registered_names_stop_at_first_gap() {
        let store = StaticSecretStore::new()
            .with_secret("QWEN_API_KEY", "a")
            .with_secret("QWEN_API_KEY_2", "b")
            .with_secret("QWEN_API_KEY_4", "d");
        let names = registered_key_names(&store, Provider::Technical);
        assert_eq!(names, vec!["QWEN_API_KEY", "QWEN_API_KEY_2"]);
    }

    #[test]
    fn empty_value_not_decryptable() {
        let store = StaticSecretStore::new().with_secret("PERPLEXITY_API_KEY", "  ");
        assert!(store.has_key("PERPLEXITY_API_KEY", false));
        assert!(!store.has_key("PERPLEXITY_API_KEY", true));
    }
}
