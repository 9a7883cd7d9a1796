//! Plugin capability traits.
//!
//! The daemon consumes extension plugins through four capability traits:
//!
//! - [`StoragePlugin`] — stores opaque ciphertext.
//! - [`EncryptionPlugin`] — derives keys and transforms plaintext to
//!   ciphertext; the derived key is held by the core.
//! - [`EncryptedStoragePlugin`] — both encrypts and stores; derived keys
//!   are passed into unlock-and-operate entry points and never leave the
//!   plugin. This is deliberately not a combination of the other two
//!   traits.
//! - [`AuthenticationPlugin`] — prompts the user.
//!
//! All plugin calls are blocking and run on the worker pool; plugin
//! implementations must be safe for concurrent invocation.

pub mod memory;
mod registry;
pub(crate) mod wrappers;

pub use registry::{PluginRegistry, Strategy};

use crate::error::SecretsResult;
use crate::key::DerivedKey;
use crate::types::{
    FilterData, FilterOperator, InteractionParameters, Secret, SecretIdentifier,
};

/// The authentication mechanisms a plugin offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthenticationTypes {
    /// System-mediated prompting (the default UI).
    pub system: bool,
    /// In-process prompting inside the calling application; callers must
    /// offer `ApplicationInteraction` and an interaction service address.
    pub application_specific: bool,
}

/// Lock participation shared by all plugin kinds.
///
/// A plugin that declares it does not support locking refuses lock-code
/// operations; the defaults opt out.
pub trait PluginLocking {
    /// Whether the plugin participates in lock-code operations.
    fn supports_locking(&self) -> bool {
        false
    }

    /// Re-keys the plugin from `old_code` to `new_code`.
    fn set_lock_code(&self, _old_code: &[u8], _new_code: &[u8]) -> bool {
        false
    }

    /// Unlocks the plugin with `code`.
    fn unlock(&self, _code: &[u8]) -> bool {
        false
    }

    /// Locks the plugin, discarding any resident key material.
    fn lock(&self) -> bool {
        false
    }
}

/// Opaque ciphertext storage keyed by collection and hashed secret name.
pub trait StoragePlugin: PluginLocking + Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Creates backing storage for a collection.
    fn create_collection(&self, collection_name: &str) -> SecretsResult<()>;

    /// Destroys a collection and everything stored under it.
    fn remove_collection(&self, collection_name: &str) -> SecretsResult<()>;

    /// Stores ciphertext under `(collection, hashed name)` with plaintext
    /// filter entries. Replaces any existing entry.
    fn set_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        ciphertext: &[u8],
        filter: &FilterData,
    ) -> SecretsResult<()>;

    /// Fetches the ciphertext and filter entries for a secret.
    fn get_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
    ) -> SecretsResult<(Vec<u8>, FilterData)>;

    /// Removes a stored secret.
    fn remove_secret(&self, collection_name: &str, hashed_secret_name: &str) -> SecretsResult<()>;

    /// Returns `(hashed name, ciphertext)` for every secret whose filter
    /// entries match.
    fn find_secrets(
        &self,
        collection_name: &str,
        filter: &FilterData,
        operator: FilterOperator,
    ) -> SecretsResult<Vec<(String, Vec<u8>)>>;

    /// Re-encrypts stored ciphertexts from `old_key` to `new_key` using
    /// the given encryption plugin. A non-empty `collection_name` with an
    /// empty name list re-encrypts the whole collection; an empty
    /// `collection_name` re-encrypts the named standalone secrets.
    fn reencrypt_secrets(
        &self,
        collection_name: &str,
        hashed_secret_names: &[String],
        old_key: &DerivedKey,
        new_key: &DerivedKey,
        encryption: &dyn EncryptionPlugin,
    ) -> SecretsResult<()>;
}

/// Key derivation and payload transformation; the core holds the keys.
pub trait EncryptionPlugin: PluginLocking + Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Derives an encryption key from an authentication code and the
    /// process salt.
    fn derive_key_from_code(&self, code: &[u8], salt: &[u8]) -> SecretsResult<DerivedKey>;

    /// Encrypts plaintext under `key`.
    fn encrypt(&self, plaintext: &[u8], key: &DerivedKey) -> SecretsResult<Vec<u8>>;

    /// Decrypts ciphertext under `key`.
    fn decrypt(&self, ciphertext: &[u8], key: &DerivedKey) -> SecretsResult<Vec<u8>>;
}

/// Combined encrypted storage: the plugin tracks its own per-collection
/// lock state and key material never crosses back to the core.
pub trait EncryptedStoragePlugin: PluginLocking + Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Creates a collection protected by `key`.
    fn create_collection(&self, collection_name: &str, key: &DerivedKey) -> SecretsResult<()>;

    /// Destroys a collection and everything stored under it.
    fn remove_collection(&self, collection_name: &str) -> SecretsResult<()>;

    /// Probes whether a collection is currently locked.
    fn is_collection_locked(&self, collection_name: &str) -> SecretsResult<bool>;

    /// Derives an encryption key from an authentication code and the
    /// process salt.
    fn derive_key_from_code(&self, code: &[u8], salt: &[u8]) -> SecretsResult<DerivedKey>;

    /// Unlocks the collection with `key` (no-op if already unlocked and
    /// `key` is empty) and stores the secret.
    fn unlock_collection_and_store_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &Secret,
        key: &DerivedKey,
    ) -> SecretsResult<()>;

    /// Unlocks the collection and reads a secret back.
    fn unlock_collection_and_read_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &DerivedKey,
    ) -> SecretsResult<Secret>;

    /// Unlocks the collection and removes a secret.
    fn unlock_collection_and_remove_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &DerivedKey,
    ) -> SecretsResult<()>;

    /// Unlocks the collection and returns identifiers of secrets whose
    /// filter entries match.
    fn unlock_and_find_secrets(
        &self,
        collection_name: &str,
        filter: &FilterData,
        operator: FilterOperator,
        key: &DerivedKey,
    ) -> SecretsResult<Vec<SecretIdentifier>>;

    /// Removes a standalone secret, verifying the device lock key when
    /// the secret is device-lock protected.
    fn unlock_and_remove_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        uses_device_lock_key: bool,
        device_lock_key: &DerivedKey,
    ) -> SecretsResult<()>;

    /// Stores a standalone secret encrypted under `key`.
    fn set_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        secret: &Secret,
        key: &DerivedKey,
    ) -> SecretsResult<()>;

    /// Reads a standalone secret encrypted under `key`.
    fn access_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        key: &DerivedKey,
    ) -> SecretsResult<Secret>;

    /// Re-encrypts a collection from `old_key` to `new_key`.
    fn unlock_collection_and_reencrypt(
        &self,
        collection_name: &str,
        old_key: &DerivedKey,
        new_key: &DerivedKey,
        device_locked: bool,
    ) -> SecretsResult<()>;
}

/// User prompting. The call blocks on the worker pool until the user
/// answers or cancels; completion is correlated by request id.
pub trait AuthenticationPlugin: PluginLocking + Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// The authentication mechanisms this plugin offers.
    fn authentication_types(&self) -> AuthenticationTypes;

    /// Shows a prompt and returns the user's input bytes.
    ///
    /// # Errors
    ///
    /// Returns `InteractionViewUserCanceled` when the user dismisses the
    /// prompt, or another error kind if the interaction fails.
    fn begin_user_input_interaction(
        &self,
        caller_pid: u32,
        request_id: u64,
        params: &InteractionParameters,
        interaction_service_address: &str,
    ) -> SecretsResult<Vec<u8>>;
}
