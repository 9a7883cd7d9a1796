//! In-memory plugin implementations for testing.
//!
//! These implementations are NOT secure for production use. They exist to
//! exercise the request processor without real hardware or storage:
//! payloads live in process memory, and the plugins expose failure
//! injection and gating hooks so tests can drive error and interleaving
//! paths deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

use crate::error::{SecretsError, SecretsResult};
use crate::key::DerivedKey;
use crate::types::{
    FilterData, FilterOperator, InteractionParameters, Secret, SecretEnvelope, SecretIdentifier,
};

use super::{
    AuthenticationPlugin, AuthenticationTypes, EncryptedStoragePlugin, EncryptionPlugin,
    PluginLocking, StoragePlugin,
};

const NONCE_SIZE: usize = 24;
const KEY_TAG_PLAINTEXT: &[u8] = b"secretkit:collection-key-tag";

fn filter_matches(stored: &FilterData, requested: &FilterData, operator: FilterOperator) -> bool {
    let entry_matches = |(k, v): (&String, &String)| stored.get(k).is_some_and(|sv| sv == v);
    match operator {
        FilterOperator::AllOf => requested.iter().all(entry_matches),
        FilterOperator::AnyOf => requested.iter().any(entry_matches),
    }
}

fn aead_encrypt(key: &DerivedKey, plaintext: &[u8]) -> SecretsResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| SecretsError::unknown("encryption key must be 32 bytes"))?;
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| SecretsError::unknown("encryption failed"))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_decrypt(key: &DerivedKey, ciphertext: &[u8]) -> SecretsResult<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE {
        return Err(SecretsError::unknown("ciphertext too short"));
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| SecretsError::unknown("encryption key must be 32 bytes"))?;
    let (nonce, payload) = ciphertext.split_at(NONCE_SIZE);
    cipher.decrypt(XNonce::from_slice(nonce), payload).map_err(|_| {
        SecretsError::IncorrectAuthenticationCode("decryption failed with the given key".into())
    })
}

fn derive_key(plugin_name: &str, code: &[u8], salt: &[u8]) -> SecretsResult<DerivedKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), code);
    let mut okm = vec![0u8; 32];
    let info = format!("secretkit:plugin-kdf:{plugin_name}");
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| SecretsError::unknown(format!("key derivation failed: {e}")))?;
    Ok(DerivedKey::from_bytes(okm))
}

fn seal_secret(secret: &Secret, key: &DerivedKey) -> SecretsResult<Vec<u8>> {
    let envelope = SecretEnvelope {
        name: secret.identifier.name.clone(),
        data: secret.data.clone(),
    };
    let plaintext = bincode::serialize(&envelope)
        .map_err(|e| SecretsError::unknown(format!("envelope serialization failed: {e}")))?;
    aead_encrypt(key, &plaintext)
}

fn open_secret(
    collection_name: &str,
    ciphertext: &[u8],
    filter: &FilterData,
    key: &DerivedKey,
) -> SecretsResult<Secret> {
    let plaintext = aead_decrypt(key, ciphertext)?;
    let envelope: SecretEnvelope = bincode::deserialize(&plaintext)
        .map_err(|e| SecretsError::unknown(format!("envelope deserialization failed: {e}")))?;
    Ok(Secret {
        identifier: SecretIdentifier::new(envelope.name, collection_name),
        data: envelope.data,
        filter_data: filter.clone(),
    })
}

// Memory Storage Plugin

#[derive(Clone)]
struct StoredEntry {
    ciphertext: Vec<u8>,
    filter: FilterData,
}

/// In-memory ciphertext store for the split strategy.
///
/// Test hooks: `inject_create_collection_failure`,
/// `inject_set_secret_failure`, and `gate_removals` (blocks
/// `remove_collection` until the returned sender fires or drops).
pub struct MemoryStoragePlugin {
    name: String,
    lockable: bool,
    lock_code: Mutex<Vec<u8>>,
    collections: Mutex<HashMap<String, HashMap<String, StoredEntry>>>,
    fail_next_create_collection: AtomicBool,
    fail_next_set_secret: AtomicBool,
    removal_gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl MemoryStoragePlugin {
    /// Creates a storage plugin that opts out of lock-code operations.
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            lockable: false,
            lock_code: Mutex::new(Vec::new()),
            collections: Mutex::new(HashMap::new()),
            fail_next_create_collection: AtomicBool::new(false),
            fail_next_set_secret: AtomicBool::new(false),
            removal_gate: Mutex::new(None),
        }
    }

    /// Creates a storage plugin that participates in lock-code
    /// operations, initially keyed by the empty code.
    #[must_use]
    pub fn with_locking<S: Into<String>>(name: S) -> Self {
        let mut plugin = Self::new(name);
        plugin.lockable = true;
        plugin
    }

    /// Makes the next `create_collection` call fail.
    pub fn inject_create_collection_failure(&self) {
        self.fail_next_create_collection.store(true, Ordering::SeqCst);
    }

    /// Makes the next `set_secret` call fail.
    pub fn inject_set_secret_failure(&self) {
        self.fail_next_set_secret.store(true, Ordering::SeqCst);
    }

    /// Blocks subsequent `remove_collection` calls until the returned
    /// sender sends or is dropped.
    pub fn gate_removals(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.removal_gate.lock() = Some(rx);
        tx
    }

    /// Number of secrets stored under a collection, for assertions.
    #[must_use]
    pub fn secret_count(&self, collection_name: &str) -> usize {
        self.collections
            .lock()
            .get(collection_name)
            .map_or(0, HashMap::len)
    }
}

impl PluginLocking for MemoryStoragePlugin {
    fn supports_locking(&self) -> bool {
        self.lockable
    }

    fn set_lock_code(&self, old_code: &[u8], new_code: &[u8]) -> bool {
        let mut code = self.lock_code.lock();
        if code.as_slice() != old_code {
            return false;
        }
        *code = new_code.to_vec();
        true
    }

    fn unlock(&self, code: &[u8]) -> bool {
        self.lock_code.lock().as_slice() == code
    }

    fn lock(&self) -> bool {
        true
    }
}

impl StoragePlugin for MemoryStoragePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn create_collection(&self, collection_name: &str) -> SecretsResult<()> {
        if self.fail_next_create_collection.swap(false, Ordering::SeqCst) {
            return Err(SecretsError::unknown("injected create_collection failure"));
        }
        let mut collections = self.collections.lock();
        if collections.contains_key(collection_name) {
            return Err(SecretsError::CollectionAlreadyExists(
                collection_name.to_string(),
            ));
        }
        collections.insert(collection_name.to_string(), HashMap::new());
        Ok(())
    }

    fn remove_collection(&self, collection_name: &str) -> SecretsResult<()> {
        if let Some(gate) = &*self.removal_gate.lock() {
            let _ = gate.recv();
        }
        self.collections.lock().remove(collection_name);
        Ok(())
    }

    fn set_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        ciphertext: &[u8],
        filter: &FilterData,
    ) -> SecretsResult<()> {
        if self.fail_next_set_secret.swap(false, Ordering::SeqCst) {
            return Err(SecretsError::unknown("injected set_secret failure"));
        }
        let mut collections = self.collections.lock();
        let entries = if collection_name == crate::types::RESERVED_COLLECTION_NAME {
            // standalone secrets have no create_collection step
            collections.entry(collection_name.to_string()).or_default()
        } else {
            collections.get_mut(collection_name).ok_or_else(|| {
                SecretsError::InvalidCollection(format!(
                    "no such collection in storage plugin: {collection_name}"
                ))
            })?
        };
        entries.insert(
            hashed_secret_name.to_string(),
            StoredEntry {
                ciphertext: ciphertext.to_vec(),
                filter: filter.clone(),
            },
        );
        Ok(())
    }

    fn get_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> SecretsResult<(Vec<u8>, FilterData)> {
        let collections = self.collections.lock();
        let entry = collections
            .get(collection_name)
            .and_then(|entries| entries.get(hashed_secret_name))
            .ok_or_else(|| {
                SecretsError::InvalidSecret(format!(
                    "no such secret in storage plugin: {hashed_secret_name}"
                ))
            })?;
        Ok((entry.ciphertext.clone(), entry.filter.clone()))
    }

    fn remove_secret(&self, collection_name: &str, hashed_secret_name: &str) -> SecretsResult<()> {
        let mut collections = self.collections.lock();
        let entries = collections.get_mut(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in storage plugin: {collection_name}"
            ))
        })?;
        entries.remove(hashed_secret_name).ok_or_else(|| {
            SecretsError::InvalidSecret(format!(
                "no such secret in storage plugin: {hashed_secret_name}"
            ))
        })?;
        Ok(())
    }

    fn find_secrets(
        &self,
        collection_name: &str,
        filter: &FilterData,
        operator: FilterOperator,
    ) -> SecretsResult<Vec<(String, Vec<u8>)>> {
        let collections = self.collections.lock();
        let entries = collections.get(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in storage plugin: {collection_name}"
            ))
        })?;
        let mut matches: Vec<(String, Vec<u8>)> = entries
            .iter()
            .filter(|(_, entry)| filter_matches(&entry.filter, filter, operator))
            .map(|(hashed, entry)| (hashed.clone(), entry.ciphertext.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }

    fn reencrypt_secrets(
        &self,
        collection_name: &str,
        hashed_secret_names: &[String],
        old_key: &DerivedKey,
        new_key: &DerivedKey,
        encryption: &dyn EncryptionPlugin,
    ) -> SecretsResult<()> {
        let mut collections = self.collections.lock();
        if collection_name.is_empty() {
            // standalone: the named secrets in the reserved collection
            let entries = match collections.get_mut(crate::types::RESERVED_COLLECTION_NAME) {
                Some(entries) => entries,
                None => return Ok(()),
            };
            for hashed in hashed_secret_names {
                if let Some(entry) = entries.get_mut(hashed) {
                    let plaintext = encryption.decrypt(&entry.ciphertext, old_key)?;
                    entry.ciphertext = encryption.encrypt(&plaintext, new_key)?;
                }
            }
            return Ok(());
        }
        let entries = collections.get_mut(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in storage plugin: {collection_name}"
            ))
        })?;
        for entry in entries.values_mut() {
            let plaintext = encryption.decrypt(&entry.ciphertext, old_key)?;
            entry.ciphertext = encryption.encrypt(&plaintext, new_key)?;
        }
        Ok(())
    }
}

// Memory Encryption Plugin

/// XChaCha20-Poly1305 encryption with an HKDF-SHA256 key derivation.
pub struct MemoryEncryptionPlugin {
    name: String,
}

impl MemoryEncryptionPlugin {
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

impl PluginLocking for MemoryEncryptionPlugin {}

impl EncryptionPlugin for MemoryEncryptionPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn derive_key_from_code(&self, code: &[u8], salt: &[u8]) -> SecretsResult<DerivedKey> {
        derive_key(&self.name, code, salt)
    }

    fn encrypt(&self, plaintext: &[u8], key: &DerivedKey) -> SecretsResult<Vec<u8>> {
        aead_encrypt(key, plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &DerivedKey) -> SecretsResult<Vec<u8>> {
        aead_decrypt(key, ciphertext)
    }
}

// Memory Encrypted Storage Plugin

struct EsEntry {
    ciphertext: Vec<u8>,
    filter: FilterData,
}

struct EsCollection {
    key_tag: Vec<u8>,
    unlocked_key: Option<DerivedKey>,
    entries: HashMap<String, EsEntry>,
}

struct StandaloneEntry {
    ciphertext: Vec<u8>,
    filter: FilterData,
    key_tag: Vec<u8>,
}

/// Combined encrypted storage: per-collection lock state tracked inside
/// the plugin, keys verified against a stored key tag.
pub struct MemoryEncryptedStoragePlugin {
    name: String,
    collections: Mutex<HashMap<String, EsCollection>>,
    standalone: Mutex<HashMap<String, StandaloneEntry>>,
    fail_next_create_collection: AtomicBool,
}

impl MemoryEncryptedStoragePlugin {
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            collections: Mutex::new(HashMap::new()),
            standalone: Mutex::new(HashMap::new()),
            fail_next_create_collection: AtomicBool::new(false),
        }
    }

    /// Makes the next `create_collection` call fail.
    pub fn inject_create_collection_failure(&self) {
        self.fail_next_create_collection.store(true, Ordering::SeqCst);
    }

    /// Relocks a collection, discarding its resident key. Test hook for
    /// simulating a plugin-side relock.
    pub fn relock_collection(&self, collection_name: &str) {
        if let Some(collection) = self.collections.lock().get_mut(collection_name) {
            collection.unlocked_key = None;
        }
    }

    fn effective_key(
        collection_name: &str,
        collection: &EsCollection,
        key: &DerivedKey,
    ) -> SecretsResult<DerivedKey> {
        // An unlocked collection keeps using its resident key; a key is
        // only verified when it would actually unlock the collection.
        if let Some(resident) = &collection.unlocked_key {
            return Ok(resident.clone());
        }
        if key.is_empty() {
            return Err(SecretsError::CollectionIsLocked(format!(
                "collection {collection_name} is locked"
            )));
        }
        aead_decrypt(key, &collection.key_tag).map_err(|_| {
            SecretsError::IncorrectAuthenticationCode(format!(
                "incorrect key for collection {collection_name}"
            ))
        })?;
        Ok(key.clone())
    }
}

impl PluginLocking for MemoryEncryptedStoragePlugin {}

impl EncryptedStoragePlugin for MemoryEncryptedStoragePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn create_collection(&self, collection_name: &str, key: &DerivedKey) -> SecretsResult<()> {
        if self.fail_next_create_collection.swap(false, Ordering::SeqCst) {
            return Err(SecretsError::unknown("injected create_collection failure"));
        }
        let mut collections = self.collections.lock();
        if collections.contains_key(collection_name) {
            return Err(SecretsError::CollectionAlreadyExists(
                collection_name.to_string(),
            ));
        }
        collections.insert(
            collection_name.to_string(),
            EsCollection {
                key_tag: aead_encrypt(key, KEY_TAG_PLAINTEXT)?,
                unlocked_key: Some(key.clone()),
                entries: HashMap::new(),
            },
        );
        Ok(())
    }

    fn remove_collection(&self, collection_name: &str) -> SecretsResult<()> {
        self.collections.lock().remove(collection_name);
        Ok(())
    }

    fn is_collection_locked(&self, collection_name: &str) -> SecretsResult<bool> {
        let collections = self.collections.lock();
        let collection = collections.get(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in encrypted storage plugin: {collection_name}"
            ))
        })?;
        Ok(collection.unlocked_key.is_none())
    }

    fn derive_key_from_code(&self, code: &[u8], salt: &[u8]) -> SecretsResult<DerivedKey> {
        derive_key(&self.name, code, salt)
    }

    fn unlock_collection_and_store_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &Secret,
        key: &DerivedKey,
    ) -> SecretsResult<()> {
        let mut collections = self.collections.lock();
        let collection = collections.get_mut(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in encrypted storage plugin: {collection_name}"
            ))
        })?;
        let effective = Self::effective_key(collection_name, collection, key)?;
        let ciphertext = seal_secret(secret, &effective)?;
        collection.unlocked_key = Some(effective);
        collection.entries.insert(
            hashed_secret_name.to_string(),
            EsEntry {
                ciphertext,
                filter: secret.filter_data.clone(),
            },
        );
        Ok(())
    }

    fn unlock_collection_and_read_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &DerivedKey,
    ) -> SecretsResult<Secret> {
        let mut collections = self.collections.lock();
        let collection = collections.get_mut(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in encrypted storage plugin: {collection_name}"
            ))
        })?;
        let effective = Self::effective_key(collection_name, collection, key)?;
        let entry = collection.entries.get(hashed_secret_name).ok_or_else(|| {
            SecretsError::InvalidSecret(format!(
                "no such secret in encrypted storage plugin: {hashed_secret_name}"
            ))
        })?;
        let secret = open_secret(collection_name, &entry.ciphertext, &entry.filter, &effective)?;
        collection.unlocked_key = Some(effective);
        Ok(secret)
    }

    fn unlock_collection_and_remove_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &DerivedKey,
    ) -> SecretsResult<()> {
        let mut collections = self.collections.lock();
        let collection = collections.get_mut(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in encrypted storage plugin: {collection_name}"
            ))
        })?;
        let effective = Self::effective_key(collection_name, collection, key)?;
        collection.unlocked_key = Some(effective);
        collection
            .entries
            .remove(hashed_secret_name)
            .ok_or_else(|| {
                SecretsError::InvalidSecret(format!(
                    "no such secret in encrypted storage plugin: {hashed_secret_name}"
                ))
            })?;
        Ok(())
    }

    fn unlock_and_find_secrets(
        &self,
        collection_name: &str,
        filter: &FilterData,
        operator: FilterOperator,
        key: &DerivedKey,
    ) -> SecretsResult<Vec<SecretIdentifier>> {
        let mut collections = self.collections.lock();
        let collection = collections.get_mut(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in encrypted storage plugin: {collection_name}"
            ))
        })?;
        let effective = Self::effective_key(collection_name, collection, key)?;
        let mut identifiers = Vec::new();
        for entry in collection.entries.values() {
            if filter_matches(&entry.filter, filter, operator) {
                let secret =
                    open_secret(collection_name, &entry.ciphertext, &entry.filter, &effective)?;
                identifiers.push(secret.identifier);
            }
        }
        collection.unlocked_key = Some(effective);
        identifiers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(identifiers)
    }

    fn unlock_and_remove_secret(
        &self,
        _collection_name: &str,
        hashed_secret_name: &str,
        uses_device_lock_key: bool,
        device_lock_key: &DerivedKey,
    ) -> SecretsResult<()> {
        let mut standalone = self.standalone.lock();
        let entry = standalone.get(hashed_secret_name).ok_or_else(|| {
            SecretsError::InvalidSecret(format!(
                "no such standalone secret in encrypted storage plugin: {hashed_secret_name}"
            ))
        })?;
        if uses_device_lock_key {
            aead_decrypt(device_lock_key, &entry.key_tag).map_err(|_| {
                SecretsError::IncorrectAuthenticationCode(
                    "incorrect device lock key for standalone secret".into(),
                )
            })?;
        }
        standalone.remove(hashed_secret_name);
        Ok(())
    }

    fn set_secret(
        &self,
        _collection_name: &str,
        hashed_secret_name: &str,
        secret: &Secret,
        key: &DerivedKey,
    ) -> SecretsResult<()> {
        let ciphertext = seal_secret(secret, key)?;
        self.standalone.lock().insert(
            hashed_secret_name.to_string(),
            StandaloneEntry {
                ciphertext,
                filter: secret.filter_data.clone(),
                key_tag: aead_encrypt(key, KEY_TAG_PLAINTEXT)?,
            },
        );
        Ok(())
    }

    fn access_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &DerivedKey,
    ) -> SecretsResult<Secret> {
        let standalone = self.standalone.lock();
        let entry = standalone.get(hashed_secret_name).ok_or_else(|| {
            SecretsError::InvalidSecret(format!(
                "no such standalone secret in encrypted storage plugin: {hashed_secret_name}"
            ))
        })?;
        open_secret(collection_name, &entry.ciphertext, &entry.filter, key)
    }

    fn unlock_collection_and_reencrypt(
        &self,
        collection_name: &str,
        old_key: &DerivedKey,
        new_key: &DerivedKey,
        _device_locked: bool,
    ) -> SecretsResult<()> {
        let mut collections = self.collections.lock();
        let collection = collections.get_mut(collection_name).ok_or_else(|| {
            SecretsError::InvalidCollection(format!(
                "no such collection in encrypted storage plugin: {collection_name}"
            ))
        })?;
        aead_decrypt(old_key, &collection.key_tag).map_err(|_| {
            SecretsError::IncorrectAuthenticationCode(format!(
                "incorrect old key for collection {collection_name}"
            ))
        })?;
        for entry in collection.entries.values_mut() {
            let plaintext = aead_decrypt(old_key, &entry.ciphertext)?;
            entry.ciphertext = aead_encrypt(new_key, &plaintext)?;
        }
        collection.key_tag = aead_encrypt(new_key, KEY_TAG_PLAINTEXT)?;
        collection.unlocked_key = Some(new_key.clone());
        Ok(())
    }
}

// Memory Authentication Plugin

/// Scripted authentication plugin: prompts are answered from a queued
/// response list, and every prompt's parameters are recorded for
/// assertions.
pub struct MemoryAuthenticationPlugin {
    name: String,
    types: AuthenticationTypes,
    responses: Mutex<VecDeque<SecretsResult<Vec<u8>>>>,
    prompts: Mutex<Vec<InteractionParameters>>,
}

impl MemoryAuthenticationPlugin {
    /// Creates a system-interaction plugin.
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            types: AuthenticationTypes {
                system: true,
                application_specific: false,
            },
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Creates a plugin that requires in-process application interaction.
    #[must_use]
    pub fn application_specific<S: Into<String>>(name: S) -> Self {
        let mut plugin = Self::new(name);
        plugin.types = AuthenticationTypes {
            system: false,
            application_specific: true,
        };
        plugin
    }

    /// Queues the user input the next prompt will return.
    pub fn push_response(&self, input: &[u8]) {
        self.responses.lock().push_back(Ok(input.to_vec()));
    }

    /// Queues a user cancellation for the next prompt.
    pub fn push_cancel(&self) {
        self.responses.lock().push_back(Err(
            SecretsError::InteractionViewUserCanceled("user canceled the prompt".into()),
        ));
    }

    /// The parameters of every prompt shown so far.
    #[must_use]
    pub fn recorded_prompts(&self) -> Vec<InteractionParameters> {
        self.prompts.lock().clone()
    }
}

impl PluginLocking for MemoryAuthenticationPlugin {}

impl AuthenticationPlugin for MemoryAuthenticationPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn authentication_types(&self) -> AuthenticationTypes {
        self.types
    }

    fn begin_user_input_interaction(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        params: &InteractionParameters,
        _interaction_service_address: &str,
    ) -> SecretsResult<Vec<u8>> {
        self.prompts.lock().push(params.clone());
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Err(SecretsError::InteractionViewUserCanceled(
                "no scripted response queued".into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{hashed_secret_name, InteractionOperation};

    fn key(plugin: &MemoryEncryptedStoragePlugin, code: &[u8]) -> DerivedKey {
        plugin.derive_key_from_code(code, b"salt").unwrap()
    }

    #[test]
    fn test_filter_matching_operators() {
        let mut stored = FilterData::new();
        stored.insert("type".into(), "password".into());
        stored.insert("domain".into(), "example.org".into());

        let mut all = FilterData::new();
        all.insert("type".into(), "password".into());
        all.insert("domain".into(), "example.org".into());
        assert!(filter_matches(&stored, &all, FilterOperator::AllOf));

        let mut partial = FilterData::new();
        partial.insert("type".into(), "password".into());
        partial.insert("domain".into(), "other.org".into());
        assert!(!filter_matches(&stored, &partial, FilterOperator::AllOf));
        assert!(filter_matches(&stored, &partial, FilterOperator::AnyOf));
    }

    #[test]
    fn test_encrypted_storage_lock_cycle() {
        let plugin = MemoryEncryptedStoragePlugin::new("es");
        let k = key(&plugin, b"code");
        plugin.create_collection("c", &k).unwrap();
        assert!(!plugin.is_collection_locked("c").unwrap());

        let secret = Secret::new(SecretIdentifier::new("s", "c"), b"abc".to_vec());
        let hashed = hashed_secret_name("c", "s");
        plugin
            .unlock_collection_and_store_secret("c", &hashed, &secret, &DerivedKey::none())
            .unwrap();

        plugin.relock_collection("c");
        assert!(plugin.is_collection_locked("c").unwrap());

        // empty key on a locked collection fails
        assert!(matches!(
            plugin.unlock_collection_and_read_secret("c", &hashed, &DerivedKey::none()),
            Err(SecretsError::CollectionIsLocked(_))
        ));
        // wrong key fails
        assert!(matches!(
            plugin.unlock_collection_and_read_secret("c", &hashed, &key(&plugin, b"bad")),
            Err(SecretsError::IncorrectAuthenticationCode(_))
        ));
        // the right key unlocks and reads
        let restored = plugin
            .unlock_collection_and_read_secret("c", &hashed, &k)
            .unwrap();
        assert_eq!(restored.data, b"abc");
        assert!(!plugin.is_collection_locked("c").unwrap());
    }

    #[test]
    fn test_encrypted_storage_reencrypt() {
        let plugin = MemoryEncryptedStoragePlugin::new("es");
        let old = key(&plugin, b"old");
        let new = key(&plugin, b"new");
        plugin.create_collection("c", &old).unwrap();
        let secret = Secret::new(SecretIdentifier::new("s", "c"), b"abc".to_vec());
        let hashed = hashed_secret_name("c", "s");
        plugin
            .unlock_collection_and_store_secret("c", &hashed, &secret, &old)
            .unwrap();

        plugin
            .unlock_collection_and_reencrypt("c", &old, &new, true)
            .unwrap();
        plugin.relock_collection("c");
        let restored = plugin
            .unlock_collection_and_read_secret("c", &hashed, &new)
            .unwrap();
        assert_eq!(restored.data, b"abc");
        plugin.relock_collection("c");
        assert!(matches!(
            plugin.unlock_collection_and_read_secret("c", &hashed, &old),
            Err(SecretsError::IncorrectAuthenticationCode(_))
        ));
    }

    #[test]
    fn test_standalone_secret_device_key_check() {
        let plugin = MemoryEncryptedStoragePlugin::new("es");
        let device = key(&plugin, b"device");
        let secret = Secret::new(SecretIdentifier::standalone("s"), b"abc".to_vec());
        let hashed = hashed_secret_name("standalone", "s");
        plugin
            .set_secret("standalone", &hashed, &secret, &device)
            .unwrap();
        assert_eq!(
            plugin
                .access_secret("standalone", &hashed, &device)
                .unwrap()
                .data,
            b"abc"
        );
        assert!(matches!(
            plugin.unlock_and_remove_secret("standalone", &hashed, true, &key(&plugin, b"bad")),
            Err(SecretsError::IncorrectAuthenticationCode(_))
        ));
        plugin
            .unlock_and_remove_secret("standalone", &hashed, true, &device)
            .unwrap();
        assert!(plugin.access_secret("standalone", &hashed, &device).is_err());
    }

    #[test]
    fn test_storage_plugin_failure_injection() {
        let plugin = MemoryStoragePlugin::new("stor");
        plugin.inject_create_collection_failure();
        assert!(plugin.create_collection("c").is_err());
        // the injection is one-shot
        plugin.create_collection("c").unwrap();
    }

    #[test]
    fn test_scripted_authentication_plugin() {
        let plugin = MemoryAuthenticationPlugin::new("auth");
        plugin.push_response(b"hunter2");
        plugin.push_cancel();
        let params =
            InteractionParameters::passphrase(InteractionOperation::StoreSecret, "enter".into());
        assert_eq!(
            plugin
                .begin_user_input_interaction(1, 1, &params, "")
                .unwrap(),
            b"hunter2"
        );
        assert!(matches!(
            plugin.begin_user_input_interaction(1, 2, &params, ""),
            Err(SecretsError::InteractionViewUserCanceled(_))
        ));
        assert_eq!(plugin.recorded_prompts().len(), 2);
    }
}
