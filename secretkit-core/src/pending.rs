//! Suspended requests awaiting a user-interaction completion.

use std::collections::HashMap;

use crate::types::{
    AccessControlMode, CollectionMetadata, FilterData, FilterOperator, InteractionParameters,
    LockCodeTarget, Secret, SecretIdentifier, UnlockSemantic, UserInteractionMode,
};

/// The continuation of a suspended request: one variant per resume point,
/// each carrying exactly the state needed to continue.
pub(crate) enum Continuation {
    /// Passphrase prompt for a new custom-lock collection.
    CreateCustomLockCollection {
        collection_name: String,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        authentication_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
    },
    /// The user supplies the secret *data* for a collection secret; the
    /// unlock ladder follows.
    SetCollectionSecretUserInput {
        secret: Secret,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: String,
        collection: CollectionMetadata,
    },
    /// Passphrase prompt to unlock the collection for a store.
    SetCollectionSecret {
        secret: Secret,
        collection: CollectionMetadata,
    },
    /// The user supplies the secret data for a standalone device-lock
    /// secret; the write follows immediately.
    WriteStandaloneDeviceLockSecret {
        secret: Secret,
        caller_application_id: String,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        hashed_secret_name: String,
        already_exists: bool,
        unlock_semantic: UnlockSemantic,
        access_control_mode: AccessControlMode,
    },
    /// The user supplies the secret data for a standalone custom-lock
    /// secret; the passphrase prompt follows.
    SetStandaloneCustomLockUserInput {
        secret: Secret,
        caller_application_id: String,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        authentication_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: String,
    },
    /// Passphrase prompt for a standalone custom-lock secret write.
    SetStandaloneCustomLockSecret {
        secret: Secret,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        authentication_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
    },
    /// Passphrase prompt to unlock the collection for a read.
    GetCollectionSecret {
        identifier: SecretIdentifier,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    },
    /// Passphrase prompt to decrypt a standalone secret.
    GetStandaloneSecret {
        identifier: SecretIdentifier,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    },
    /// Passphrase prompt to unlock the collection for a filter query.
    FindCollectionSecrets {
        collection_name: String,
        filter: FilterData,
        filter_operator: FilterOperator,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    },
    /// Passphrase prompt to unlock the collection for a secret deletion.
    ///
    /// The plugin names captured at validation select the KDF plugin; the
    /// final phase re-reads collection metadata afresh.
    DeleteCollectionSecret {
        identifier: SecretIdentifier,
        storage_plugin_name: String,
        encryption_plugin_name: String,
    },
    /// Lock-code modification: prompt for the old code, then the new one.
    ModifyLockCode {
        target: LockCodeTarget,
        target_name: String,
        interaction_params: InteractionParameters,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: String,
        /// `None` while awaiting the old code; `Some` while awaiting the
        /// new one.
        old_lock_code: Option<Vec<u8>>,
    },
    /// Lock-code provision prompt.
    ProvideLockCode {
        target: LockCodeTarget,
        target_name: String,
    },
    /// User-input passthrough: the input bytes are the reply.
    UserInput,
}

/// A request suspended between a prompt dispatch and its completion.
pub(crate) struct PendingRequest {
    pub caller_pid: u32,
    pub request_id: u64,
    pub continuation: Continuation,
}

/// Map from request id to suspended request. Every pending request id is
/// unique across the process and maps to exactly one continuation.
#[derive(Default)]
pub(crate) struct PendingRequestTable {
    requests: HashMap<u64, PendingRequest>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: PendingRequest) {
        self.requests.insert(request.request_id, request);
    }

    pub fn take(&mut self, request_id: u64) -> Option<PendingRequest> {
        self.requests.remove(&request_id)
    }

    #[cfg(test)]
    pub fn contains(&self, request_id: u64) -> bool {
        self.requests.contains_key(&request_id)
    }
}
