//! Collection-secret operations.
//!
//! Every operation climbs the same unlock ladder: load and validate
//! metadata, probe the lock state (a plugin call in the encrypted-storage
//! strategy, a key-cache lookup in the split strategy), prompt for a
//! passphrase if locked and permitted, derive the key, then perform the
//! plugin operation.

use std::sync::Arc;

use secretkit_db::DbError;

use crate::error::{SecretsError, SecretsResult};
use crate::key::DerivedKey;
use crate::pending::Continuation;
use crate::plugin::{wrappers, Strategy};
use crate::types::{
    hashed_secret_name, CollectionMetadata, EchoMode, FilterData, FilterOperator, InputType,
    InteractionOperation, InteractionParameters, Outcome, Reply, Secret, SecretIdentifier,
    SecretMetadata, UnlockSemantic, UserInteractionMode,
};

use super::{
    check_collection_name, check_collection_secret_identifier, run_blocking, RequestProcessor,
};

/// Result of probing a collection's unlock state.
pub(crate) enum UnlockProbe {
    /// The collection is unlocked; use this key (empty in the
    /// encrypted-storage strategy, where the plugin holds the real one).
    Unlocked(DerivedKey),
    /// Locked, custom-lock, and interaction is permitted: prompt.
    NeedsPrompt,
}

impl RequestProcessor {
    /// Probes whether the collection is unlocked, failing immediately
    /// for locked device-lock collections and for callers whose
    /// interaction mode forbids the required prompt.
    pub(crate) async fn probe_unlock_state(
        &self,
        metadata: &CollectionMetadata,
        strategy: &Strategy,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<UnlockProbe> {
        let locked = match strategy {
            Strategy::Encrypted(plugin) => {
                self.probe_collection_locked(plugin, &metadata.collection_name)
                    .await?
            }
            Strategy::Split { .. } => {
                match self.key_cache.lock().collection_key(&metadata.collection_name) {
                    Some(key) => return Ok(UnlockProbe::Unlocked(key)),
                    None => true,
                }
            }
        };
        if !locked {
            return Ok(UnlockProbe::Unlocked(DerivedKey::none()));
        }
        if metadata.uses_device_lock_key {
            return Err(SecretsError::CollectionIsLocked(format!(
                "collection {} is locked and requires device lock authentication",
                metadata.collection_name
            )));
        }
        self.check_interaction_allowed(
            &metadata.authentication_plugin_name,
            user_interaction_mode,
            interaction_service_address,
        )?;
        Ok(UnlockProbe::NeedsPrompt)
    }

    // Set

    /// Stores a secret in a collection. When `user_input_params` is
    /// given, the secret *data* is first collected from the user.
    pub async fn set_collection_secret(
        &self,
        caller_pid: u32,
        request_id: u64,
        secret: Secret,
        user_input_params: Option<InteractionParameters>,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        check_collection_secret_identifier(&secret.identifier)?;
        self.guard.ensure_not_busy(&secret.identifier.collection_name)?;
        let metadata =
            self.validated_collection_metadata(caller_pid, &secret.identifier.collection_name)?;
        self.registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;

        let Some(ui_params) = user_input_params else {
            return self
                .set_collection_secret_get_authentication_code(
                    caller_pid,
                    request_id,
                    secret,
                    user_interaction_mode,
                    interaction_service_address,
                    metadata,
                )
                .await;
        };

        // collect the secret data from the user first
        let plugin = self.user_input_plugin(&ui_params.authentication_plugin_name)?;
        let mut prompt = ui_params;
        prompt.application_id = self.caller_application_id(caller_pid);
        prompt.collection_name = secret.identifier.collection_name.clone();
        prompt.secret_name = secret.identifier.name.clone();
        prompt.operation = InteractionOperation::RequestUserData;
        prompt.prompt_text = format!(
            "Enter confidential data for secret {} in collection {} stored by plugin {}",
            secret.identifier.name,
            secret.identifier.collection_name,
            metadata.storage_plugin_name
        );
        self.dispatch_prompt(
            plugin,
            caller_pid,
            request_id,
            prompt,
            interaction_service_address,
            Continuation::SetCollectionSecretUserInput {
                secret,
                user_interaction_mode,
                interaction_service_address: interaction_service_address.to_string(),
                collection: metadata,
            },
        )
    }

    /// Second phase of a collection-secret store: probe lock state and
    /// either continue directly or prompt for the unlock passphrase.
    pub(crate) async fn set_collection_secret_get_authentication_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        secret: Secret,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
        metadata: CollectionMetadata,
    ) -> SecretsResult<Outcome> {
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;
        match self
            .probe_unlock_state(
                &metadata,
                &strategy,
                user_interaction_mode,
                interaction_service_address,
            )
            .await?
        {
            UnlockProbe::Unlocked(key) => {
                self.set_collection_secret_with_encryption_key(
                    caller_pid, request_id, secret, metadata, key,
                )
                .await
            }
            UnlockProbe::NeedsPrompt => {
                let plugin = self.user_input_plugin(&metadata.authentication_plugin_name)?;
                let prompt = InteractionParameters {
                    application_id: self.caller_application_id(caller_pid),
                    collection_name: secret.identifier.collection_name.clone(),
                    secret_name: secret.identifier.name.clone(),
                    authentication_plugin_name: metadata.authentication_plugin_name.clone(),
                    operation: InteractionOperation::StoreSecret,
                    input_type: InputType::AlphaNumeric,
                    echo_mode: EchoMode::PasswordEchoOnEdit,
                    prompt_text: format!(
                        "Enter the passphrase to unlock the collection {} in order to store \
                         secret {}",
                        secret.identifier.collection_name, secret.identifier.name
                    ),
                };
                self.dispatch_prompt(
                    plugin,
                    caller_pid,
                    request_id,
                    prompt,
                    interaction_service_address,
                    Continuation::SetCollectionSecret {
                        secret,
                        collection: metadata,
                    },
                )
            }
        }
    }

    /// Continues a store once the unlock passphrase is in hand.
    pub(crate) async fn set_collection_secret_with_authentication_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        secret: Secret,
        metadata: CollectionMetadata,
        authentication_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;
        let key = self.derive_key(&strategy, authentication_code).await?;
        self.set_collection_secret_with_encryption_key(caller_pid, request_id, secret, metadata, key)
            .await
    }

    /// Final phase of a collection-secret store: ensure the bookkeeping
    /// row, perform the plugin write, compensate on failure.
    pub(crate) async fn set_collection_secret_with_encryption_key(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        secret: Secret,
        metadata: CollectionMetadata,
        key: DerivedKey,
    ) -> SecretsResult<Outcome> {
        let collection_name = secret.identifier.collection_name.clone();
        let hashed_name = hashed_secret_name(&collection_name, &secret.identifier.name);

        let already_exists = self.bkdb.secret_exists(&collection_name, &hashed_name)?;
        if !already_exists {
            // write to the bookkeeping database prior to the storage plugin
            let row = SecretMetadata {
                collection_name: collection_name.clone(),
                hashed_secret_name: hashed_name.clone(),
                application_id: metadata.application_id.clone(),
                uses_device_lock_key: metadata.uses_device_lock_key,
                storage_plugin_name: metadata.storage_plugin_name.clone(),
                encryption_plugin_name: metadata.encryption_plugin_name.clone(),
                authentication_plugin_name: metadata.authentication_plugin_name.clone(),
                unlock_semantic: metadata.unlock_semantic,
                custom_lock_timeout_ms: metadata.custom_lock_timeout_ms,
                access_control_mode: metadata.access_control_mode,
            };
            self.bkdb.insert_secret(&row.to_record())?;
        }

        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;
        let plugin_result = match &strategy {
            Strategy::Encrypted(plugin) => {
                let plugin = Arc::clone(plugin);
                let collection = collection_name.clone();
                let hashed = hashed_name.clone();
                let secret = secret.clone();
                let key = key.clone();
                run_blocking(move || {
                    plugin.unlock_collection_and_store_secret(&collection, &hashed, &secret, &key)
                })
                .await
            }
            Strategy::Split {
                storage,
                encryption,
            } => {
                if !self.key_cache.lock().contains_collection(&collection_name) {
                    self.cache_collection_key(&metadata, key.clone());
                }
                let storage = Arc::clone(storage);
                let encryption = Arc::clone(encryption);
                let collection = collection_name.clone();
                let hashed = hashed_name.clone();
                let secret = secret.clone();
                let key = key.clone();
                run_blocking(move || {
                    wrappers::encrypt_and_store_secret(
                        &encryption,
                        &storage,
                        &collection,
                        &hashed,
                        &secret,
                        &key,
                    )
                })
                .await
            }
        };

        match plugin_result {
            Ok(()) => Ok(Outcome::Completed(Reply::Done)),
            Err(plugin_err) if !already_exists => {
                // the row was new; compensate on the bookkeeping side
                Err(self.cleanup_delete_secret(&collection_name, &hashed_name, plugin_err))
            }
            Err(plugin_err) => Err(plugin_err),
        }
    }

    // Get

    /// Reads a secret from a collection.
    pub async fn get_collection_secret(
        &self,
        caller_pid: u32,
        request_id: u64,
        identifier: SecretIdentifier,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        check_collection_secret_identifier(&identifier)?;
        self.guard.ensure_not_busy(&identifier.collection_name)?;
        let metadata =
            self.validated_collection_metadata(caller_pid, &identifier.collection_name)?;
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;
        if !self
            .registry
            .has_authentication(&metadata.authentication_plugin_name)
        {
            return Err(SecretsError::InvalidExtensionPlugin(format!(
                "no such authentication plugin available: {}",
                metadata.authentication_plugin_name
            )));
        }

        match self
            .probe_unlock_state(
                &metadata,
                &strategy,
                user_interaction_mode,
                interaction_service_address,
            )
            .await?
        {
            UnlockProbe::Unlocked(key) => {
                self.get_collection_secret_with_encryption_key(
                    caller_pid,
                    request_id,
                    identifier,
                    metadata.storage_plugin_name,
                    metadata.encryption_plugin_name,
                    metadata.unlock_semantic,
                    metadata.custom_lock_timeout_ms,
                    key,
                )
                .await
            }
            UnlockProbe::NeedsPrompt => {
                let plugin = self.user_input_plugin(&metadata.authentication_plugin_name)?;
                let prompt = InteractionParameters {
                    application_id: self.caller_application_id(caller_pid),
                    collection_name: identifier.collection_name.clone(),
                    secret_name: identifier.name.clone(),
                    authentication_plugin_name: metadata.authentication_plugin_name.clone(),
                    operation: InteractionOperation::ReadSecret,
                    input_type: InputType::AlphaNumeric,
                    echo_mode: EchoMode::PasswordEchoOnEdit,
                    prompt_text: format!(
                        "Enter the passphrase to unlock the collection {} in order to read \
                         secret {}",
                        identifier.collection_name, identifier.name
                    ),
                };
                self.dispatch_prompt(
                    plugin,
                    caller_pid,
                    request_id,
                    prompt,
                    interaction_service_address,
                    Continuation::GetCollectionSecret {
                        identifier,
                        storage_plugin_name: metadata.storage_plugin_name,
                        encryption_plugin_name: metadata.encryption_plugin_name,
                        unlock_semantic: metadata.unlock_semantic,
                        custom_lock_timeout_ms: metadata.custom_lock_timeout_ms,
                    },
                )
            }
        }
    }

    /// Continues a read once the unlock passphrase is in hand.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn get_collection_secret_with_authentication_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        identifier: SecretIdentifier,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        authentication_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        let strategy = self
            .registry
            .resolve_strategy(&storage_plugin_name, &encryption_plugin_name)?;
        let key = self.derive_key(&strategy, authentication_code).await?;
        self.get_collection_secret_with_encryption_key(
            caller_pid,
            request_id,
            identifier,
            storage_plugin_name,
            encryption_plugin_name,
            unlock_semantic,
            custom_lock_timeout_ms,
            key,
        )
        .await
    }

    /// Final phase of a read: arm the relock timer and fetch from the
    /// plugin.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn get_collection_secret_with_encryption_key(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        identifier: SecretIdentifier,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        key: DerivedKey,
    ) -> SecretsResult<Outcome> {
        let strategy = self
            .registry
            .resolve_strategy(&storage_plugin_name, &encryption_plugin_name)?;
        let collection_name = identifier.collection_name.clone();
        let hashed_name = hashed_secret_name(&collection_name, &identifier.name);

        let secret = match &strategy {
            Strategy::Encrypted(plugin) => {
                let plugin = Arc::clone(plugin);
                let collection = collection_name.clone();
                let hashed = hashed_name.clone();
                let key = key.clone();
                run_blocking(move || {
                    plugin.unlock_collection_and_read_secret(&collection, &hashed, &key)
                })
                .await?
            }
            Strategy::Split {
                storage,
                encryption,
            } => {
                let (effective_key, inserted_now) = {
                    let mut cache = self.key_cache.lock();
                    match cache.collection_key(&collection_name) {
                        Some(cached) => (cached, false),
                        None => {
                            cache.insert_collection_key(&collection_name, key.clone());
                            (key.clone(), true)
                        }
                    }
                };
                self.arm_collection_relock_timer(
                    &collection_name,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                );
                let storage = Arc::clone(storage);
                let encryption = Arc::clone(encryption);
                let collection = collection_name.clone();
                let hashed = hashed_name.clone();
                let result = run_blocking(move || {
                    wrappers::get_and_decrypt_secret(
                        &encryption,
                        &storage,
                        &collection,
                        &hashed,
                        &effective_key,
                    )
                })
                .await;
                match result {
                    Ok(secret) => secret,
                    Err(err) => {
                        // an unverified key that failed to decrypt must
                        // not stay resident as "unlocked" state
                        if inserted_now {
                            self.key_cache.lock().remove_collection(&collection_name);
                        }
                        return Err(err);
                    }
                }
            }
        };
        Ok(Outcome::Completed(Reply::Secret(secret)))
    }

    // Find

    /// Lists identifiers of collection secrets matching a filter.
    #[allow(clippy::too_many_arguments)]
    pub async fn find_collection_secrets(
        &self,
        caller_pid: u32,
        request_id: u64,
        collection_name: &str,
        filter: FilterData,
        filter_operator: FilterOperator,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        check_collection_name(collection_name)?;
        if filter.is_empty() {
            return Err(SecretsError::InvalidFilter("empty filter given".into()));
        }
        self.guard.ensure_not_busy(collection_name)?;
        let metadata = self.validated_collection_metadata(caller_pid, collection_name)?;
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;
        if !self
            .registry
            .has_authentication(&metadata.authentication_plugin_name)
        {
            return Err(SecretsError::InvalidExtensionPlugin(format!(
                "no such authentication plugin available: {}",
                metadata.authentication_plugin_name
            )));
        }

        match self
            .probe_unlock_state(
                &metadata,
                &strategy,
                user_interaction_mode,
                interaction_service_address,
            )
            .await?
        {
            UnlockProbe::Unlocked(key) => {
                self.find_collection_secrets_with_encryption_key(
                    caller_pid,
                    request_id,
                    collection_name.to_string(),
                    filter,
                    filter_operator,
                    metadata.storage_plugin_name,
                    metadata.encryption_plugin_name,
                    metadata.unlock_semantic,
                    metadata.custom_lock_timeout_ms,
                    key,
                )
                .await
            }
            UnlockProbe::NeedsPrompt => {
                let plugin = self.user_input_plugin(&metadata.authentication_plugin_name)?;
                let prompt = InteractionParameters {
                    application_id: self.caller_application_id(caller_pid),
                    collection_name: collection_name.to_string(),
                    secret_name: String::new(),
                    authentication_plugin_name: metadata.authentication_plugin_name.clone(),
                    operation: InteractionOperation::UnlockCollection,
                    input_type: InputType::AlphaNumeric,
                    echo_mode: EchoMode::PasswordEchoOnEdit,
                    prompt_text: format!(
                        "Enter the passphrase to unlock the collection {collection_name} in \
                         order to find secrets"
                    ),
                };
                self.dispatch_prompt(
                    plugin,
                    caller_pid,
                    request_id,
                    prompt,
                    interaction_service_address,
                    Continuation::FindCollectionSecrets {
                        collection_name: collection_name.to_string(),
                        filter,
                        filter_operator,
                        storage_plugin_name: metadata.storage_plugin_name,
                        encryption_plugin_name: metadata.encryption_plugin_name,
                        unlock_semantic: metadata.unlock_semantic,
                        custom_lock_timeout_ms: metadata.custom_lock_timeout_ms,
                    },
                )
            }
        }
    }

    /// Continues a find once the unlock passphrase is in hand.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn find_collection_secrets_with_authentication_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        collection_name: String,
        filter: FilterData,
        filter_operator: FilterOperator,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        authentication_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        let strategy = self
            .registry
            .resolve_strategy(&storage_plugin_name, &encryption_plugin_name)?;
        let key = self.derive_key(&strategy, authentication_code).await?;
        self.find_collection_secrets_with_encryption_key(
            caller_pid,
            request_id,
            collection_name,
            filter,
            filter_operator,
            storage_plugin_name,
            encryption_plugin_name,
            unlock_semantic,
            custom_lock_timeout_ms,
            key,
        )
        .await
    }

    /// Final phase of a find: arm the relock timer and run the filter
    /// query.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn find_collection_secrets_with_encryption_key(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        collection_name: String,
        filter: FilterData,
        filter_operator: FilterOperator,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        key: DerivedKey,
    ) -> SecretsResult<Outcome> {
        let strategy = self
            .registry
            .resolve_strategy(&storage_plugin_name, &encryption_plugin_name)?;

        let identifiers = match &strategy {
            Strategy::Encrypted(plugin) => {
                let plugin = Arc::clone(plugin);
                let collection = collection_name.clone();
                let key = key.clone();
                run_blocking(move || {
                    plugin.unlock_and_find_secrets(&collection, &filter, filter_operator, &key)
                })
                .await?
            }
            Strategy::Split {
                storage,
                encryption,
            } => {
                let (effective_key, inserted_now) = {
                    let mut cache = self.key_cache.lock();
                    match cache.collection_key(&collection_name) {
                        Some(cached) => (cached, false),
                        None => {
                            cache.insert_collection_key(&collection_name, key.clone());
                            (key.clone(), true)
                        }
                    }
                };
                self.arm_collection_relock_timer(
                    &collection_name,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                );
                let storage = Arc::clone(storage);
                let encryption = Arc::clone(encryption);
                let collection = collection_name.clone();
                let result = run_blocking(move || {
                    wrappers::find_and_decrypt_secret_names(
                        &encryption,
                        &storage,
                        &collection,
                        &filter,
                        filter_operator,
                        &effective_key,
                    )
                })
                .await;
                match result {
                    Ok(identifiers) => identifiers,
                    Err(err) => {
                        if inserted_now {
                            self.key_cache.lock().remove_collection(&collection_name);
                        }
                        return Err(err);
                    }
                }
            }
        };
        Ok(Outcome::Completed(Reply::Identifiers(identifiers)))
    }

    // Delete

    /// Deletes a secret from a collection.
    pub async fn delete_collection_secret(
        &self,
        caller_pid: u32,
        request_id: u64,
        identifier: SecretIdentifier,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        check_collection_secret_identifier(&identifier)?;
        self.guard.ensure_not_busy(&identifier.collection_name)?;
        let metadata =
            self.validated_collection_metadata(caller_pid, &identifier.collection_name)?;
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;

        match self
            .probe_unlock_state(
                &metadata,
                &strategy,
                user_interaction_mode,
                interaction_service_address,
            )
            .await?
        {
            UnlockProbe::Unlocked(key) => {
                // an unlocked encrypted-storage probe yields no key; the
                // device lock key stands in so the continuation's key
                // check holds for device-locked collections
                let key = if key.is_empty() {
                    self.device_lock_key()
                } else {
                    key
                };
                self.delete_collection_secret_with_encryption_key(
                    caller_pid, request_id, identifier, key,
                )
                .await
            }
            UnlockProbe::NeedsPrompt => {
                let plugin = self.user_input_plugin(&metadata.authentication_plugin_name)?;
                let prompt = InteractionParameters {
                    application_id: self.caller_application_id(caller_pid),
                    collection_name: identifier.collection_name.clone(),
                    secret_name: identifier.name.clone(),
                    authentication_plugin_name: metadata.authentication_plugin_name.clone(),
                    operation: InteractionOperation::DeleteSecret,
                    input_type: InputType::AlphaNumeric,
                    echo_mode: EchoMode::PasswordEchoOnEdit,
                    prompt_text: format!(
                        "Enter the passphrase to unlock the collection {} in order to delete \
                         secret {}",
                        identifier.collection_name, identifier.name
                    ),
                };
                self.dispatch_prompt(
                    plugin,
                    caller_pid,
                    request_id,
                    prompt,
                    interaction_service_address,
                    Continuation::DeleteCollectionSecret {
                        identifier,
                        storage_plugin_name: metadata.storage_plugin_name,
                        encryption_plugin_name: metadata.encryption_plugin_name,
                    },
                )
            }
        }
    }

    /// Continues a delete once the unlock passphrase is in hand. The
    /// plugin names captured at validation select the KDF plugin; the
    /// final phase re-reads collection metadata afresh.
    pub(crate) async fn delete_collection_secret_with_authentication_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        identifier: SecretIdentifier,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        authentication_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        let strategy = self
            .registry
            .resolve_strategy(&storage_plugin_name, &encryption_plugin_name)?;
        let key = self.derive_key(&strategy, authentication_code).await?;
        self.delete_collection_secret_with_encryption_key(caller_pid, request_id, identifier, key)
            .await
    }

    /// Final phase of a delete: re-validate against fresh metadata,
    /// remove from the plugin, then remove the bookkeeping row.
    pub(crate) async fn delete_collection_secret_with_encryption_key(
        &self,
        caller_pid: u32,
        _request_id: u64,
        identifier: SecretIdentifier,
        key: DerivedKey,
    ) -> SecretsResult<Outcome> {
        // re-read in case the collection was deleted or modified while
        // the authentication flow was in progress
        let metadata =
            self.validated_collection_metadata(caller_pid, &identifier.collection_name)?;
        if metadata.uses_device_lock_key && key != self.device_lock_key() {
            return Err(SecretsError::IncorrectAuthenticationCode(
                "incorrect device lock key provided".into(),
            ));
        }
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;

        let collection_name = identifier.collection_name.clone();
        let hashed_name = hashed_secret_name(&collection_name, &identifier.name);

        let plugin_result = match &strategy {
            Strategy::Encrypted(plugin) => {
                let plugin = Arc::clone(plugin);
                let collection = collection_name.clone();
                let hashed = hashed_name.clone();
                let key = key.clone();
                run_blocking(move || {
                    plugin.unlock_collection_and_remove_secret(&collection, &hashed, &key)
                })
                .await
            }
            Strategy::Split { storage, .. } => {
                if !self.key_cache.lock().contains_collection(&collection_name) {
                    self.cache_collection_key(&metadata, key.clone());
                }
                let storage = Arc::clone(storage);
                let collection = collection_name.clone();
                let hashed = hashed_name.clone();
                run_blocking(move || storage.remove_secret(&collection, &hashed)).await
            }
        };
        plugin_result?;

        if let Err(delete_err) = self.bkdb.delete_secret(&collection_name, &hashed_name) {
            self.mark_secret_dirty(&collection_name, &hashed_name);
            return Err(SecretsError::Database(format!(
                "secret was removed from plugin storage but its bookkeeping row could not be \
                 deleted: {delete_err}"
            )));
        }
        Ok(Outcome::Completed(Reply::Done))
    }

    // Crypto-layer helpers

    /// Inserts only the bookkeeping row for a secret whose payload the
    /// external crypto layer stores directly in the plugin. Requires the
    /// encrypted-storage strategy.
    pub async fn set_collection_secret_metadata(
        &self,
        caller_pid: u32,
        _request_id: u64,
        identifier: SecretIdentifier,
    ) -> SecretsResult<Outcome> {
        check_collection_secret_identifier(&identifier)?;
        self.guard.ensure_not_busy(&identifier.collection_name)?;
        let metadata =
            self.validated_collection_metadata(caller_pid, &identifier.collection_name)?;
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;
        let Strategy::Encrypted(plugin) = strategy else {
            return Err(SecretsError::InvalidExtensionPlugin(
                "the identified collection is not encrypted by its storage plugin".into(),
            ));
        };

        let locked = self
            .probe_collection_locked(&plugin, &identifier.collection_name)
            .await?;
        if locked {
            if metadata.uses_device_lock_key {
                return Err(SecretsError::CollectionIsLocked(format!(
                    "collection {} is locked and requires device lock authentication",
                    identifier.collection_name
                )));
            }
            return Err(SecretsError::OperationRequiresUserInteraction(format!(
                "collection {} is locked and requires user interaction to unlock",
                identifier.collection_name
            )));
        }

        let hashed_name = hashed_secret_name(&identifier.collection_name, &identifier.name);
        if self
            .bkdb
            .secret_exists(&identifier.collection_name, &hashed_name)?
        {
            // reported so the crypto layer knows it must not delete the
            // metadata if its own store fails
            return Err(SecretsError::SecretAlreadyExists(format!(
                "a secret named {} already exists in collection {}",
                identifier.name, identifier.collection_name
            )));
        }

        let row = SecretMetadata {
            collection_name: identifier.collection_name.clone(),
            hashed_secret_name: hashed_name,
            application_id: metadata.application_id.clone(),
            uses_device_lock_key: metadata.uses_device_lock_key,
            storage_plugin_name: metadata.storage_plugin_name.clone(),
            encryption_plugin_name: metadata.encryption_plugin_name.clone(),
            authentication_plugin_name: metadata.authentication_plugin_name.clone(),
            unlock_semantic: metadata.unlock_semantic,
            custom_lock_timeout_ms: metadata.custom_lock_timeout_ms,
            access_control_mode: metadata.access_control_mode,
        };
        self.bkdb.insert_secret(&row.to_record()).map_err(|err| match err {
            DbError::AlreadyExists(name) => SecretsError::SecretAlreadyExists(name),
            other => other.into(),
        })?;
        Ok(Outcome::Completed(Reply::Done))
    }

    /// Removes the bookkeeping row inserted by
    /// [`Self::set_collection_secret_metadata`] after the crypto layer
    /// failed to store the payload.
    pub async fn delete_collection_secret_metadata(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        identifier: SecretIdentifier,
    ) -> SecretsResult<Outcome> {
        check_collection_secret_identifier(&identifier)?;
        let hashed_name = hashed_secret_name(&identifier.collection_name, &identifier.name);
        self.bkdb
            .delete_secret(&identifier.collection_name, &hashed_name)?;
        Ok(Outcome::Completed(Reply::Done))
    }

    /// Collects raw input from the user on behalf of the caller; the
    /// input bytes are returned to the caller as the reply.
    pub async fn user_input(
        &self,
        caller_pid: u32,
        request_id: u64,
        params: InteractionParameters,
    ) -> SecretsResult<Outcome> {
        let plugin = self.user_input_plugin(&params.authentication_plugin_name)?;
        let mut prompt = params;
        prompt.application_id = self.caller_application_id(caller_pid);
        if prompt.collection_name.is_empty() && prompt.secret_name.is_empty() {
            // data entered here goes back to the requesting application;
            // warn the user it is not secrets-storage protected
            prompt.prompt_text = format!(
                "An application is requesting input which will be returned to the \
                 application: {}",
                prompt.prompt_text
            );
        }
        self.dispatch_prompt(
            plugin,
            caller_pid,
            request_id,
            prompt,
            "",
            Continuation::UserInput,
        )
    }
}
