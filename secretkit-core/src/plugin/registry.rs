//! Plugin registry and execution-strategy resolution.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{SecretsError, SecretsResult};
use crate::types::{PluginInfo, PluginInfoReport};

use super::{AuthenticationPlugin, EncryptedStoragePlugin, EncryptionPlugin, StoragePlugin};

/// How a `(storage, encryption)` plugin pair executes.
///
/// Equal names select a combined encrypted-storage plugin; distinct names
/// select the split strategy where the core holds the derived key.
#[derive(Clone)]
pub enum Strategy {
    /// One plugin both encrypts and stores; keys never leave it.
    Encrypted(Arc<dyn EncryptedStoragePlugin>),
    /// Distinct plugins; the encryption plugin transforms payloads with a
    /// key held by the core, the storage plugin stores ciphertext.
    Split {
        storage: Arc<dyn StoragePlugin>,
        encryption: Arc<dyn EncryptionPlugin>,
    },
}

/// Holds handles to every loaded plugin by name and capability set.
#[derive(Default)]
pub struct PluginRegistry {
    storage: HashMap<String, Arc<dyn StoragePlugin>>,
    encryption: HashMap<String, Arc<dyn EncryptionPlugin>>,
    encrypted_storage: HashMap<String, Arc<dyn EncryptedStoragePlugin>>,
    authentication: HashMap<String, Arc<dyn AuthenticationPlugin>>,
    crypto_storage: HashMap<String, Arc<dyn EncryptedStoragePlugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_storage(&mut self, plugin: Arc<dyn StoragePlugin>) {
        self.storage.insert(plugin.name().to_string(), plugin);
    }

    pub fn register_encryption(&mut self, plugin: Arc<dyn EncryptionPlugin>) {
        self.encryption.insert(plugin.name().to_string(), plugin);
    }

    pub fn register_encrypted_storage(&mut self, plugin: Arc<dyn EncryptedStoragePlugin>) {
        self.encrypted_storage
            .insert(plugin.name().to_string(), plugin);
    }

    /// Registers an encrypted-storage plugin that additionally backs the
    /// external crypto layer and participates in plugin-wide lock
    /// operations under that role.
    pub fn register_crypto_storage(&mut self, plugin: Arc<dyn EncryptedStoragePlugin>) {
        self.crypto_storage
            .insert(plugin.name().to_string(), plugin.clone());
        self.encrypted_storage
            .insert(plugin.name().to_string(), plugin);
    }

    pub fn register_authentication(&mut self, plugin: Arc<dyn AuthenticationPlugin>) {
        self.authentication
            .insert(plugin.name().to_string(), plugin);
    }

    pub fn storage(&self, name: &str) -> Option<Arc<dyn StoragePlugin>> {
        self.storage.get(name).cloned()
    }

    pub fn encryption(&self, name: &str) -> Option<Arc<dyn EncryptionPlugin>> {
        self.encryption.get(name).cloned()
    }

    pub fn encrypted_storage(&self, name: &str) -> Option<Arc<dyn EncryptedStoragePlugin>> {
        self.encrypted_storage.get(name).cloned()
    }

    pub fn crypto_storage(&self, name: &str) -> Option<Arc<dyn EncryptedStoragePlugin>> {
        self.crypto_storage.get(name).cloned()
    }

    pub fn authentication(&self, name: &str) -> Option<Arc<dyn AuthenticationPlugin>> {
        self.authentication.get(name).cloned()
    }

    pub fn has_authentication(&self, name: &str) -> bool {
        self.authentication.contains_key(name)
    }

    pub fn all_storage(&self) -> Vec<Arc<dyn StoragePlugin>> {
        self.storage.values().cloned().collect()
    }

    pub fn all_encryption(&self) -> Vec<Arc<dyn EncryptionPlugin>> {
        self.encryption.values().cloned().collect()
    }

    pub fn all_encrypted_storage(&self) -> Vec<Arc<dyn EncryptedStoragePlugin>> {
        self.encrypted_storage.values().cloned().collect()
    }

    /// Names of loaded authentication plugins, for startup diagnostics.
    pub fn authentication_names(&self) -> Vec<String> {
        self.authentication.keys().cloned().collect()
    }

    /// Resolves a `(storage, encryption)` name pair into its execution
    /// strategy, verifying both names still resolve.
    ///
    /// # Errors
    ///
    /// Returns `InvalidExtensionPlugin` naming the missing plugin; for
    /// names loaded from bookkeeping rows this signals stale metadata.
    pub fn resolve_strategy(
        &self,
        storage_plugin_name: &str,
        encryption_plugin_name: &str,
    ) -> SecretsResult<Strategy> {
        if storage_plugin_name == encryption_plugin_name {
            let plugin = self.encrypted_storage(storage_plugin_name).ok_or_else(|| {
                SecretsError::InvalidExtensionPlugin(format!(
                    "no such encrypted storage plugin exists: {storage_plugin_name}"
                ))
            })?;
            return Ok(Strategy::Encrypted(plugin));
        }
        let storage = self.storage(storage_plugin_name).ok_or_else(|| {
            SecretsError::InvalidExtensionPlugin(format!(
                "no such storage plugin exists: {storage_plugin_name}"
            ))
        })?;
        let encryption = self.encryption(encryption_plugin_name).ok_or_else(|| {
            SecretsError::InvalidExtensionPlugin(format!(
                "no such encryption plugin exists: {encryption_plugin_name}"
            ))
        })?;
        Ok(Strategy::Split {
            storage,
            encryption,
        })
    }

    /// Descriptors of every loaded plugin, per kind.
    #[must_use]
    pub fn plugin_info_report(&self) -> PluginInfoReport {
        fn info<I: IntoIterator<Item = (String, String)>>(items: I) -> Vec<PluginInfo> {
            let mut infos: Vec<PluginInfo> = items
                .into_iter()
                .map(|(name, version)| PluginInfo { name, version })
                .collect();
            infos.sort_by(|a, b| a.name.cmp(&b.name));
            infos
        }
        PluginInfoReport {
            storage_plugins: info(
                self.storage
                    .values()
                    .map(|p| (p.name().to_string(), p.version().to_string())),
            ),
            encryption_plugins: info(
                self.encryption
                    .values()
                    .map(|p| (p.name().to_string(), p.version().to_string())),
            ),
            encrypted_storage_plugins: info(
                self.encrypted_storage
                    .values()
                    .map(|p| (p.name().to_string(), p.version().to_string())),
            ),
            authentication_plugins: info(
                self.authentication
                    .values()
                    .map(|p| (p.name().to_string(), p.version().to_string())),
            ),
        }
    }
}
