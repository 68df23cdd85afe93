//! Storage manager: routes operations to the provider registered under a
//! profile name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use cloudshelf_core::config::AppConfig;
use cloudshelf_core::error::AppError;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::ConnectionStatus;

use crate::factory;

/// Registry of constructed providers keyed by profile name.
#[derive(Debug, Clone)]
pub struct StorageManager {
    providers: Arc<RwLock<HashMap<String, Arc<dyn StorageProvider>>>>,
    default_name: Arc<RwLock<Option<String>>>,
}

impl StorageManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
            default_name: Arc::new(RwLock::new(None)),
        }
    }

    /// Build every configured profile. A profile that fails to build is
    /// logged and skipped so one bad profile does not hide the others.
    pub async fn from_config(config: &AppConfig) -> Self {
        let manager = Self::new();
        let default = config.default_profile_name().ok();
        for name in config.profiles.keys() {
            let built = match config.profile(name) {
                Ok(profile) => factory::build(profile, config.transfer.clone()).await,
                Err(e) => Err(e),
            };
            match built {
                Ok(provider) => {
                    let is_default = default.as_deref() == Some(name.as_str());
                    manager.register(name, provider, is_default).await;
                }
                Err(e) => warn!(profile = %name, error = %e, "Skipping profile"),
            }
        }
        info!(count = manager.names().await.len(), "Storage providers initialized");
        manager
    }

    /// Register a provider under `name`.
    pub async fn register(&self, name: &str, provider: Arc<dyn StorageProvider>, is_default: bool) {
        self.providers
            .write()
            .await
            .insert(name.to_string(), provider);
        if is_default {
            *self.default_name.write().await = Some(name.to_string());
        }
    }

    /// Provider registered under `name`.
    pub async fn get(&self, name: &str) -> AppResult<Arc<dyn StorageProvider>> {
        let providers = self.providers.read().await;
        providers
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Storage profile '{name}' is not available")))
    }

    /// The default provider and its name.
    pub async fn get_default(&self) -> AppResult<(String, Arc<dyn StorageProvider>)> {
        let name = self
            .default_name
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::configuration("No default storage profile configured"))?;
        let provider = self.get(&name).await?;
        Ok((name, provider))
    }

    /// Registered profile names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the connection test of every registered provider, one at a time.
    pub async fn test_all(&self) -> BTreeMap<String, ConnectionStatus> {
        let providers: Vec<(String, Arc<dyn StorageProvider>)> = self
            .providers
            .read()
            .await
            .iter()
            .map(|(name, provider)| (name.clone(), Arc::clone(provider)))
            .collect();
        let mut results = BTreeMap::new();
        for (name, provider) in providers {
            results.insert(name, provider.test_connection().await);
        }
        results
    }
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &str) -> AppConfig {
        AppConfig::from_toml_str(&format!(
            r#"
default_profile = "disk"

[profiles.disk]
type = "local"
root_path = "{root}"

[profiles.broken]
type = "qiniu"
access_key = "ak"
secret_key = "sk"
bucket = "b"
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_from_config_skips_invalid_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::from_config(&config(&dir.path().display().to_string())).await;

        assert_eq!(manager.names().await, vec!["disk"]);
        let (name, provider) = manager.get_default().await.unwrap();
        assert_eq!(name, "disk");
        assert!(provider.test_connection().await.success);
        assert!(manager.get("broken").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_test_all() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::from_config(&config(&dir.path().display().to_string())).await;
        let results = manager.test_all().await;
        assert_eq!(results.len(), 1);
        assert!(results["disk"].success);
    }

    #[tokio::test]
    async fn test_empty_manager_has_no_default() {
        let manager = StorageManager::default();
        assert!(manager.get_default().await.is_err());
    }
}
