//! Core type definitions for the secrets daemon.
//!
//! This module contains the data structures shared by the request
//! processor, the plugin traits and the bookkeeping gateway seam.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use secretkit_db::{CollectionRecord, SecretRecord};

use crate::error::{SecretsError, SecretsResult};

/// The reserved collection name used to address standalone secrets.
pub const RESERVED_COLLECTION_NAME: &str = "standalone";

/// The system default authentication plugin name.
pub const DEFAULT_AUTHENTICATION_PLUGIN: &str = "secretkit.plugin.authentication.system";

/// Suffix appended to the default authentication plugin name in autotest
/// mode.
pub const AUTOTEST_PLUGIN_SUFFIX: &str = ".test";

const HASHED_NAME_LABEL: &[u8] = b"secretkit:hashed-secret-name";

/// Returns true if `name` collides with the reserved standalone
/// collection name, compared case-insensitively.
#[must_use]
pub fn is_reserved_collection_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(RESERVED_COLLECTION_NAME)
}

/// Derives the storage key for a secret from its collection and name.
///
/// The daemon never hands plaintext secret names to storage plugins; they
/// only ever see this digest.
#[must_use]
pub fn hashed_secret_name(collection_name: &str, secret_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(HASHED_NAME_LABEL);
    hasher.update(collection_name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(secret_name.as_bytes());
    hex::encode(hasher.finalize())
}

// Identifiers and secrets

/// Identifies a secret by name and owning collection.
///
/// An empty collection name denotes a standalone secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretIdentifier {
    /// The secret's name, unique within its collection.
    pub name: String,
    /// The owning collection, or empty for standalone secrets.
    pub collection_name: String,
}

impl SecretIdentifier {
    /// Creates an identifier for a secret in a collection.
    #[must_use]
    pub fn new<N: Into<String>, C: Into<String>>(name: N, collection_name: C) -> Self {
        Self {
            name: name.into(),
            collection_name: collection_name.into(),
        }
    }

    /// Creates an identifier for a standalone secret.
    #[must_use]
    pub fn standalone<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            collection_name: String::new(),
        }
    }
}

impl fmt::Display for SecretIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.collection_name.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.collection_name, self.name)
        }
    }
}

/// Key/value filter data attached to a secret, matched by
/// [`FilterOperator`] in find requests.
pub type FilterData = BTreeMap<String, String>;

/// How a filter's entries combine in a find request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    /// Every filter entry must match.
    AllOf,
    /// At least one filter entry must match.
    AnyOf,
}

/// A secret: identifier, payload, and filter data.
///
/// The payload only ever exists in transient buffers on its way to or
/// from a plugin; the daemon persists metadata alone.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// The secret's identifier.
    pub identifier: SecretIdentifier,
    /// The secret payload.
    pub data: Vec<u8>,
    /// Plaintext filter entries used by find requests.
    pub filter_data: FilterData,
}

impl Secret {
    /// Creates a secret with empty filter data.
    #[must_use]
    pub fn new(identifier: SecretIdentifier, data: Vec<u8>) -> Self {
        Self {
            identifier,
            data,
            filter_data: FilterData::new(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("identifier", &self.identifier)
            .field("data", &"[REDACTED]")
            .field("filter_data", &self.filter_data)
            .finish()
    }
}

/// The plaintext content sealed into a split-strategy ciphertext: the
/// secret's real name travels inside the envelope so that find requests
/// can recover identifiers by decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretEnvelope {
    /// The secret's plaintext name.
    pub name: String,
    /// The secret payload.
    pub data: Vec<u8>,
}

// Lock and access-control semantics

/// When a derived key is evicted again after an unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlockSemantic {
    /// Stay unlocked until the daemon exits or is explicitly locked.
    KeepUnlocked,
    /// Relock when the device lock engages.
    RelockOnDeviceLock,
    /// Relock after the custom lock timeout elapses.
    RelockAfterTimeout,
}

impl UnlockSemantic {
    pub(crate) fn to_raw(self) -> i64 {
        match self {
            Self::KeepUnlocked => 0,
            Self::RelockOnDeviceLock => 1,
            Self::RelockAfterTimeout => 2,
        }
    }

    pub(crate) fn from_raw(raw: i64) -> SecretsResult<Self> {
        match raw {
            0 => Ok(Self::KeepUnlocked),
            1 => Ok(Self::RelockOnDeviceLock),
            2 => Ok(Self::RelockAfterTimeout),
            other => Err(SecretsError::Database(format!(
                "invalid unlock semantic in bookkeeping row: {other}"
            ))),
        }
    }
}

/// Who may operate on a collection or secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessControlMode {
    /// Only the owning application.
    OwnerOnly,
    /// Mediated by the system access-control service.
    System,
}

impl AccessControlMode {
    pub(crate) fn to_raw(self) -> i64 {
        match self {
            Self::OwnerOnly => 0,
            Self::System => 1,
        }
    }

    pub(crate) fn from_raw(raw: i64) -> SecretsResult<Self> {
        match raw {
            0 => Ok(Self::OwnerOnly),
            1 => Ok(Self::System),
            other => Err(SecretsError::Database(format!(
                "invalid access control mode in bookkeeping row: {other}"
            ))),
        }
    }
}

/// Whether and how the caller allows user prompts for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserInteractionMode {
    /// Fail rather than prompt.
    PreventInteraction,
    /// Prompt through the system authentication plugin UI.
    SystemInteraction,
    /// Prompt in-process through the caller's interaction service.
    ApplicationInteraction,
}

// Interaction parameters

/// The operation a prompt is shown for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionOperation {
    CreateCollection,
    StoreSecret,
    ReadSecret,
    DeleteSecret,
    UnlockCollection,
    ModifyLockPlugin,
    ModifyLockDatabase,
    UnlockPlugin,
    UnlockDatabase,
    RequestUserData,
}

/// The kind of input a prompt collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputType {
    /// Free-form alphanumeric entry.
    AlphaNumeric,
    /// A yes/no confirmation.
    Confirmation,
}

/// How entered input is echoed back to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EchoMode {
    Normal,
    Password,
    PasswordEchoOnEdit,
}

/// Parameters for a user-interaction prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionParameters {
    /// The application the prompt is shown on behalf of.
    pub application_id: String,
    /// The collection the prompt concerns, if any.
    pub collection_name: String,
    /// The secret the prompt concerns, if any.
    pub secret_name: String,
    /// The authentication plugin to prompt with; empty selects the
    /// configured default.
    pub authentication_plugin_name: String,
    /// The operation being authorised.
    pub operation: InteractionOperation,
    /// The input type to collect.
    pub input_type: InputType,
    /// The echo mode for entered input.
    pub echo_mode: EchoMode,
    /// The prompt text shown to the user.
    pub prompt_text: String,
}

impl InteractionParameters {
    /// A passphrase prompt template for the given operation.
    #[must_use]
    pub fn passphrase(operation: InteractionOperation, prompt_text: String) -> Self {
        Self {
            application_id: String::new(),
            collection_name: String::new(),
            secret_name: String::new(),
            authentication_plugin_name: String::new(),
            operation,
            input_type: InputType::AlphaNumeric,
            echo_mode: EchoMode::PasswordEchoOnEdit,
            prompt_text,
        }
    }
}

/// The target of a lock-code operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockCodeTarget {
    /// A standalone secret (not yet supported).
    StandaloneSecret,
    /// A collection (not yet supported).
    Collection,
    /// A named extension plugin.
    ExtensionPlugin,
    /// The bookkeeping database, i.e. the daemon master lock.
    BookkeepingDatabase,
}

// Metadata

/// Typed view of a collection's bookkeeping row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMetadata {
    pub collection_name: String,
    pub application_id: String,
    pub uses_device_lock_key: bool,
    pub storage_plugin_name: String,
    pub encryption_plugin_name: String,
    pub authentication_plugin_name: String,
    pub unlock_semantic: UnlockSemantic,
    pub custom_lock_timeout_ms: u64,
    pub access_control_mode: AccessControlMode,
}

impl CollectionMetadata {
    pub(crate) fn from_record(record: CollectionRecord) -> SecretsResult<Self> {
        Ok(Self {
            collection_name: record.collection_name,
            application_id: record.application_id,
            uses_device_lock_key: record.uses_device_lock_key,
            storage_plugin_name: record.storage_plugin_name,
            encryption_plugin_name: record.encryption_plugin_name,
            authentication_plugin_name: record.authentication_plugin_name,
            unlock_semantic: UnlockSemantic::from_raw(record.unlock_semantic)?,
            custom_lock_timeout_ms: record.custom_lock_timeout_ms.max(0) as u64,
            access_control_mode: AccessControlMode::from_raw(record.access_control_mode)?,
        })
    }

    pub(crate) fn to_record(&self) -> CollectionRecord {
        CollectionRecord {
            collection_name: self.collection_name.clone(),
            application_id: self.application_id.clone(),
            uses_device_lock_key: self.uses_device_lock_key,
            storage_plugin_name: self.storage_plugin_name.clone(),
            encryption_plugin_name: self.encryption_plugin_name.clone(),
            authentication_plugin_name: self.authentication_plugin_name.clone(),
            unlock_semantic: self.unlock_semantic.to_raw(),
            custom_lock_timeout_ms: self.custom_lock_timeout_ms as i64,
            access_control_mode: self.access_control_mode.to_raw(),
        }
    }

    /// True when the storage plugin is also the encryption plugin, i.e.
    /// the collection lives in an encrypted-storage plugin.
    #[must_use]
    pub fn uses_encrypted_storage(&self) -> bool {
        self.storage_plugin_name == self.encryption_plugin_name
    }
}

/// Typed view of a secret's bookkeeping row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMetadata {
    pub collection_name: String,
    pub hashed_secret_name: String,
    pub application_id: String,
    pub uses_device_lock_key: bool,
    pub storage_plugin_name: String,
    pub encryption_plugin_name: String,
    pub authentication_plugin_name: String,
    pub unlock_semantic: UnlockSemantic,
    pub custom_lock_timeout_ms: u64,
    pub access_control_mode: AccessControlMode,
}

impl SecretMetadata {
    pub(crate) fn from_record(record: SecretRecord) -> SecretsResult<Self> {
        Ok(Self {
            collection_name: record.collection_name,
            hashed_secret_name: record.hashed_secret_name,
            application_id: record.application_id,
            uses_device_lock_key: record.uses_device_lock_key,
            storage_plugin_name: record.storage_plugin_name,
            encryption_plugin_name: record.encryption_plugin_name,
            authentication_plugin_name: record.authentication_plugin_name,
            unlock_semantic: UnlockSemantic::from_raw(record.unlock_semantic)?,
            custom_lock_timeout_ms: record.custom_lock_timeout_ms.max(0) as u64,
            access_control_mode: AccessControlMode::from_raw(record.access_control_mode)?,
        })
    }

    pub(crate) fn to_record(&self) -> SecretRecord {
        SecretRecord {
            collection_name: self.collection_name.clone(),
            hashed_secret_name: self.hashed_secret_name.clone(),
            application_id: self.application_id.clone(),
            uses_device_lock_key: self.uses_device_lock_key,
            storage_plugin_name: self.storage_plugin_name.clone(),
            encryption_plugin_name: self.encryption_plugin_name.clone(),
            authentication_plugin_name: self.authentication_plugin_name.clone(),
            unlock_semantic: self.unlock_semantic.to_raw(),
            custom_lock_timeout_ms: self.custom_lock_timeout_ms as i64,
            access_control_mode: self.access_control_mode.to_raw(),
        }
    }

    /// True when the storage plugin is also the encryption plugin.
    #[must_use]
    pub fn uses_encrypted_storage(&self) -> bool {
        self.storage_plugin_name == self.encryption_plugin_name
    }
}

// Plugin descriptors

/// A plugin's name and version, as reported by `get_plugin_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

/// Descriptors of every loaded plugin, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfoReport {
    pub storage_plugins: Vec<PluginInfo>,
    pub encryption_plugins: Vec<PluginInfo>,
    pub encrypted_storage_plugins: Vec<PluginInfo>,
    pub authentication_plugins: Vec<PluginInfo>,
}

// Replies

/// The payload of a finished request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The operation completed with no output parameters.
    Done,
    /// A decrypted secret.
    Secret(Secret),
    /// Identifiers matched by a find request.
    Identifiers(Vec<SecretIdentifier>),
    /// Raw user input returned by a user-input passthrough request.
    UserInput(Vec<u8>),
}

/// How a request left the processor's entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request finished; the reply is in hand.
    Completed(Reply),
    /// The request is suspended awaiting a user-interaction completion;
    /// its terminal result will arrive on the finished channel.
    Pending,
}

/// A terminal result delivered on the finished channel for a request that
/// previously returned [`Outcome::Pending`].
#[derive(Debug)]
pub struct RequestFinished {
    pub request_id: u64,
    pub result: SecretsResult<Reply>,
}
