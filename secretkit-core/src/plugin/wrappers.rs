//! Split-strategy helpers and plugin-wide lock operations.
//!
//! These functions combine an encryption plugin and a storage plugin into
//! the compound operations the processor schedules on the worker pool. In
//! the split strategy the secret's plaintext name travels inside the
//! encrypted envelope so that find requests can recover identifiers.

use std::sync::Arc;

use log::warn;

use crate::error::{SecretsError, SecretsResult};
use crate::key::DerivedKey;
use crate::types::{
    FilterData, FilterOperator, Secret, SecretEnvelope, SecretIdentifier,
};

use super::registry::PluginRegistry;
use super::{EncryptionPlugin, StoragePlugin};

fn seal_envelope(
    encryption: &dyn EncryptionPlugin,
    secret: &Secret,
    key: &DerivedKey,
) -> SecretsResult<Vec<u8>> {
    let envelope = SecretEnvelope {
        name: secret.identifier.name.clone(),
        data: secret.data.clone(),
    };
    let plaintext = bincode::serialize(&envelope)
        .map_err(|e| SecretsError::unknown(format!("failed to serialize secret envelope: {e}")))?;
    encryption.encrypt(&plaintext, key)
}

fn open_envelope(
    encryption: &dyn EncryptionPlugin,
    ciphertext: &[u8],
    key: &DerivedKey,
) -> SecretsResult<SecretEnvelope> {
    let plaintext = encryption.decrypt(ciphertext, key)?;
    bincode::deserialize(&plaintext)
        .map_err(|e| SecretsError::unknown(format!("failed to deserialize secret envelope: {e}")))
}

/// Encrypts a secret and stores the ciphertext under its hashed name.
pub(crate) fn encrypt_and_store_secret(
    encryption: &Arc<dyn EncryptionPlugin>,
    storage: &Arc<dyn StoragePlugin>,
    collection_name: &str,
    hashed_secret_name: &str,
    secret: &Secret,
    key: &DerivedKey,
) -> SecretsResult<()> {
    let ciphertext = seal_envelope(encryption.as_ref(), secret, key)?;
    storage.set_secret(
        collection_name,
        hashed_secret_name,
        &ciphertext,
        &secret.filter_data,
    )
}

/// Fetches a ciphertext and decrypts it back into a secret.
pub(crate) fn get_and_decrypt_secret(
    encryption: &Arc<dyn EncryptionPlugin>,
    storage: &Arc<dyn StoragePlugin>,
    collection_name: &str,
    hashed_secret_name: &str,
    key: &DerivedKey,
) -> SecretsResult<Secret> {
    let (ciphertext, filter_data) = storage.get_secret(collection_name, hashed_secret_name)?;
    let envelope = open_envelope(encryption.as_ref(), &ciphertext, key)?;
    Ok(Secret {
        identifier: SecretIdentifier::new(envelope.name, collection_name),
        data: envelope.data,
        filter_data,
    })
}

/// Runs a filter query and decrypts the matching ciphertexts' envelopes
/// to recover plaintext secret names.
pub(crate) fn find_and_decrypt_secret_names(
    encryption: &Arc<dyn EncryptionPlugin>,
    storage: &Arc<dyn StoragePlugin>,
    collection_name: &str,
    filter: &FilterData,
    operator: FilterOperator,
    key: &DerivedKey,
) -> SecretsResult<Vec<SecretIdentifier>> {
    let matches = storage.find_secrets(collection_name, filter, operator)?;
    let mut identifiers = Vec::with_capacity(matches.len());
    for (_hashed_name, ciphertext) in matches {
        let envelope = open_envelope(encryption.as_ref(), &ciphertext, key)?;
        identifiers.push(SecretIdentifier::new(envelope.name, collection_name));
    }
    Ok(identifiers)
}

// Plugin-wide lock operations

/// A lock-capable plugin resolved by name from any of the plugin maps,
/// so targeted lock-code operations can dispatch uniformly.
pub(crate) enum LockTargetPlugin {
    Storage(Arc<dyn StoragePlugin>),
    Encryption(Arc<dyn EncryptionPlugin>),
    EncryptedStorage(Arc<dyn super::EncryptedStoragePlugin>),
    Authentication(Arc<dyn super::AuthenticationPlugin>),
}

impl LockTargetPlugin {
    pub fn supports_locking(&self) -> bool {
        match self {
            Self::Storage(p) => p.supports_locking(),
            Self::Encryption(p) => p.supports_locking(),
            Self::EncryptedStorage(p) => p.supports_locking(),
            Self::Authentication(p) => p.supports_locking(),
        }
    }

    pub fn set_lock_code(&self, old_code: &[u8], new_code: &[u8]) -> bool {
        match self {
            Self::Storage(p) => p.set_lock_code(old_code, new_code),
            Self::Encryption(p) => p.set_lock_code(old_code, new_code),
            Self::EncryptedStorage(p) => p.set_lock_code(old_code, new_code),
            Self::Authentication(p) => p.set_lock_code(old_code, new_code),
        }
    }

    pub fn unlock(&self, code: &[u8]) -> bool {
        match self {
            Self::Storage(p) => p.unlock(code),
            Self::Encryption(p) => p.unlock(code),
            Self::EncryptedStorage(p) => p.unlock(code),
            Self::Authentication(p) => p.unlock(code),
        }
    }

    pub fn lock(&self) -> bool {
        match self {
            Self::Storage(p) => p.lock(),
            Self::Encryption(p) => p.lock(),
            Self::EncryptedStorage(p) => p.lock(),
            Self::Authentication(p) => p.lock(),
        }
    }
}

/// Resolves a lock-code target across the storage, encryption,
/// encrypted-storage, authentication and crypto-storage plugin maps.
pub(crate) fn find_lock_target_plugin(
    registry: &PluginRegistry,
    target: &str,
) -> Option<LockTargetPlugin> {
    if let Some(p) = registry.storage(target) {
        return Some(LockTargetPlugin::Storage(p));
    }
    if let Some(p) = registry.encryption(target) {
        return Some(LockTargetPlugin::Encryption(p));
    }
    if let Some(p) = registry.encrypted_storage(target) {
        return Some(LockTargetPlugin::EncryptedStorage(p));
    }
    if let Some(p) = registry.authentication(target) {
        return Some(LockTargetPlugin::Authentication(p));
    }
    registry
        .crypto_storage(target)
        .map(LockTargetPlugin::EncryptedStorage)
}

/// Maps a plugin's lock-op refusal into the client-facing error.
pub(crate) fn apply_lock_op(
    plugin_name: &str,
    supports: bool,
    applied: bool,
    operation: &str,
) -> SecretsResult<()> {
    if !supports {
        return Err(SecretsError::OperationNotSupported(format!(
            "plugin {plugin_name} does not support locking"
        )));
    }
    if !applied {
        return Err(SecretsError::Unknown(format!(
            "failed to {operation} plugin {plugin_name}"
        )));
    }
    Ok(())
}

/// Re-keys every lock-capable storage and encrypted-storage plugin to the
/// new device lock key. Per-plugin failures are logged and skipped; the
/// affected plugin stays readable only under the old key.
pub(crate) fn modify_master_lock_plugins(
    storage_plugins: &[Arc<dyn StoragePlugin>],
    encrypted_storage_plugins: &[Arc<dyn super::EncryptedStoragePlugin>],
    old_key: &DerivedKey,
    new_key: &DerivedKey,
) {
    for plugin in storage_plugins {
        if plugin.supports_locking()
            && !plugin.set_lock_code(old_key.as_bytes(), new_key.as_bytes())
        {
            warn!("failed to re-key storage plugin {}", plugin.name());
        }
    }
    for plugin in encrypted_storage_plugins {
        if plugin.supports_locking()
            && !plugin.set_lock_code(old_key.as_bytes(), new_key.as_bytes())
        {
            warn!("failed to re-key encrypted storage plugin {}", plugin.name());
        }
    }
}

/// Unlocks every lock-capable storage and encrypted-storage plugin with
/// the device lock key.
pub(crate) fn master_unlock_plugins(
    storage_plugins: &[Arc<dyn StoragePlugin>],
    encrypted_storage_plugins: &[Arc<dyn super::EncryptedStoragePlugin>],
    device_lock_key: &DerivedKey,
) {
    for plugin in storage_plugins {
        if plugin.supports_locking() && !plugin.unlock(device_lock_key.as_bytes()) {
            warn!("failed to unlock storage plugin {}", plugin.name());
        }
    }
    for plugin in encrypted_storage_plugins {
        if plugin.supports_locking() && !plugin.unlock(device_lock_key.as_bytes()) {
            warn!("failed to unlock encrypted storage plugin {}", plugin.name());
        }
    }
}

/// Locks every lock-capable storage and encrypted-storage plugin.
pub(crate) fn master_lock_plugins(
    storage_plugins: &[Arc<dyn StoragePlugin>],
    encrypted_storage_plugins: &[Arc<dyn super::EncryptedStoragePlugin>],
) {
    for plugin in storage_plugins {
        if plugin.supports_locking() && !plugin.lock() {
            warn!("failed to lock storage plugin {}", plugin.name());
        }
    }
    for plugin in encrypted_storage_plugins {
        if plugin.supports_locking() && !plugin.lock() {
            warn!("failed to lock encrypted storage plugin {}", plugin.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::memory::{MemoryEncryptionPlugin, MemoryStoragePlugin};
    use crate::types::hashed_secret_name;

    fn split_pair() -> (Arc<dyn EncryptionPlugin>, Arc<dyn StoragePlugin>) {
        (
            Arc::new(MemoryEncryptionPlugin::new("enc")),
            Arc::new(MemoryStoragePlugin::new("stor")),
        )
    }

    #[test]
    fn test_envelope_round_trip_recovers_name_and_data() {
        let (encryption, storage) = split_pair();
        storage.create_collection("mail").unwrap();
        let key = encryption.derive_key_from_code(b"code", b"salt").unwrap();

        let mut secret = Secret::new(SecretIdentifier::new("smtp", "mail"), b"abc".to_vec());
        secret
            .filter_data
            .insert("proto".to_string(), "smtp".to_string());
        let hashed = hashed_secret_name("mail", "smtp");

        encrypt_and_store_secret(&encryption, &storage, "mail", &hashed, &secret, &key).unwrap();
        let restored =
            get_and_decrypt_secret(&encryption, &storage, "mail", &hashed, &key).unwrap();
        assert_eq!(restored.identifier.name, "smtp");
        assert_eq!(restored.data, b"abc");
        assert_eq!(restored.filter_data, secret.filter_data);

        let found = find_and_decrypt_secret_names(
            &encryption,
            &storage,
            "mail",
            &secret.filter_data,
            FilterOperator::AllOf,
            &key,
        )
        .unwrap();
        assert_eq!(found, vec![SecretIdentifier::new("smtp", "mail")]);
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let (encryption, storage) = split_pair();
        storage.create_collection("mail").unwrap();
        let key = encryption.derive_key_from_code(b"code", b"salt").unwrap();
        let wrong = encryption.derive_key_from_code(b"wrong", b"salt").unwrap();

        let secret = Secret::new(SecretIdentifier::new("smtp", "mail"), b"abc".to_vec());
        let hashed = hashed_secret_name("mail", "smtp");
        encrypt_and_store_secret(&encryption, &storage, "mail", &hashed, &secret, &key).unwrap();

        assert!(get_and_decrypt_secret(&encryption, &storage, "mail", &hashed, &wrong).is_err());
    }
}
