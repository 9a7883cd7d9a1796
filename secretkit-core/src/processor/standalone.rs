//! Standalone-secret operations.
//!
//! Standalone secrets live outside any client collection; they are
//! addressed through the reserved collection name, and their hashed
//! storage key is derived from it. Once a standalone secret exists, its
//! lock kind and storage plugin are immutable: a write that would change
//! either fails rather than silently re-protecting the secret.

use std::sync::Arc;

use crate::error::{SecretsError, SecretsResult};
use crate::key::DerivedKey;
use crate::pending::Continuation;
use crate::plugin::{wrappers, Strategy};
use crate::types::{
    hashed_secret_name, AccessControlMode, EchoMode, InputType, InteractionOperation,
    InteractionParameters, Outcome, Reply, Secret, SecretIdentifier, SecretMetadata,
    UnlockSemantic, UserInteractionMode, RESERVED_COLLECTION_NAME,
};

use super::{run_blocking, RequestProcessor};

/// Existing-row constraints checked before any standalone write.
struct ExistingStandalone {
    found: bool,
}

impl RequestProcessor {
    fn check_standalone_identifier(identifier: &SecretIdentifier) -> SecretsResult<()> {
        if identifier.name.is_empty() {
            return Err(SecretsError::InvalidSecret("empty secret name given".into()));
        }
        if !identifier.collection_name.is_empty() {
            return Err(SecretsError::InvalidCollection(
                "non-empty collection name given for standalone secret request".into(),
            ));
        }
        Ok(())
    }

    /// Validates an existing standalone row against the incoming write:
    /// ownership, lock kind immutability, storage plugin immutability.
    fn check_existing_standalone(
        &self,
        caller_pid: u32,
        secret_name: &str,
        hashed_name: &str,
        wants_device_lock: bool,
        storage_plugin_name: &str,
    ) -> SecretsResult<ExistingStandalone> {
        let Some(record) = self
            .bkdb
            .secret_metadata(RESERVED_COLLECTION_NAME, hashed_name)?
        else {
            return Ok(ExistingStandalone { found: false });
        };
        let existing = SecretMetadata::from_record(record)?;
        if existing.access_control_mode == AccessControlMode::System {
            return Err(SecretsError::OperationNotSupported(
                "access control requests are not currently supported".into(),
            ));
        }
        if existing.application_id != self.caller_application_id(caller_pid) {
            return Err(SecretsError::Permissions(format!(
                "secret {secret_name} is owned by a different application"
            )));
        }
        if existing.uses_device_lock_key != wants_device_lock {
            return Err(SecretsError::OperationNotSupported(format!(
                "secret {secret_name} already exists with a different lock kind"
            )));
        }
        if !existing
            .storage_plugin_name
            .eq_ignore_ascii_case(storage_plugin_name)
        {
            return Err(SecretsError::OperationNotSupported(format!(
                "secret {secret_name} already exists and is not stored via plugin \
                 {storage_plugin_name}"
            )));
        }
        Ok(ExistingStandalone { found: true })
    }

    // Device-lock standalone

    /// Stores a standalone secret protected by the device lock key.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_standalone_device_lock_secret(
        &self,
        caller_pid: u32,
        request_id: u64,
        storage_plugin_name: &str,
        encryption_plugin_name: &str,
        secret: Secret,
        user_input_params: Option<InteractionParameters>,
        unlock_semantic: UnlockSemantic,
        access_control_mode: AccessControlMode,
        _user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        Self::check_standalone_identifier(&secret.identifier)?;
        self.registry
            .resolve_strategy(storage_plugin_name, encryption_plugin_name)?;
        let caller_application_id = self.caller_application_id(caller_pid);
        let hashed_name = hashed_secret_name(RESERVED_COLLECTION_NAME, &secret.identifier.name);

        let existing = self.check_existing_standalone(
            caller_pid,
            &secret.identifier.name,
            &hashed_name,
            true,
            storage_plugin_name,
        )?;

        let Some(ui_params) = user_input_params else {
            return self
                .write_standalone_device_lock_secret(
                    caller_pid,
                    request_id,
                    caller_application_id,
                    storage_plugin_name.to_string(),
                    encryption_plugin_name.to_string(),
                    secret,
                    hashed_name,
                    existing.found,
                    unlock_semantic,
                    access_control_mode,
                )
                .await;
        };

        let plugin = self.user_input_plugin(&ui_params.authentication_plugin_name)?;
        let mut prompt = ui_params;
        prompt.application_id = caller_application_id.clone();
        prompt.secret_name = secret.identifier.name.clone();
        prompt.operation = InteractionOperation::RequestUserData;
        prompt.prompt_text = format!(
            "Enter confidential data for standalone secret {} stored by plugin {}",
            secret.identifier.name, storage_plugin_name
        );
        self.dispatch_prompt(
            plugin,
            caller_pid,
            request_id,
            prompt,
            interaction_service_address,
            Continuation::WriteStandaloneDeviceLockSecret {
                secret,
                caller_application_id,
                storage_plugin_name: storage_plugin_name.to_string(),
                encryption_plugin_name: encryption_plugin_name.to_string(),
                hashed_secret_name: hashed_name,
                already_exists: existing.found,
                unlock_semantic,
                access_control_mode,
            },
        )
    }

    /// Writes a standalone device-lock secret: bookkeeping row first,
    /// then the plugin, compensating a failed write of a new secret.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn write_standalone_device_lock_secret(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        caller_application_id: String,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        secret: Secret,
        hashed_name: String,
        already_exists: bool,
        unlock_semantic: UnlockSemantic,
        access_control_mode: AccessControlMode,
    ) -> SecretsResult<Outcome> {
        let row = SecretMetadata {
            collection_name: RESERVED_COLLECTION_NAME.to_string(),
            hashed_secret_name: hashed_name.clone(),
            application_id: caller_application_id,
            uses_device_lock_key: true,
            storage_plugin_name: storage_plugin_name.clone(),
            encryption_plugin_name: encryption_plugin_name.clone(),
            authentication_plugin_name: self.broker_default_authentication_plugin(),
            unlock_semantic,
            custom_lock_timeout_ms: 0,
            access_control_mode,
        };
        if already_exists {
            self.bkdb.update_secret(&row.to_record())?;
        } else {
            self.bkdb.insert_secret(&row.to_record())?;
        }

        let device_lock_key = self.device_lock_key();
        let plugin_result = self
            .store_standalone_secret(
                &storage_plugin_name,
                &encryption_plugin_name,
                &secret,
                &hashed_name,
                device_lock_key.clone(),
            )
            .await;

        match plugin_result {
            Ok(split_strategy) => {
                if split_strategy {
                    self.cache_standalone_key(&hashed_name, device_lock_key, unlock_semantic, 0);
                }
                Ok(Outcome::Completed(Reply::Done))
            }
            Err(plugin_err) if !already_exists => Err(self.cleanup_delete_secret(
                RESERVED_COLLECTION_NAME,
                &hashed_name,
                plugin_err,
            )),
            Err(plugin_err) => Err(plugin_err),
        }
    }

    // Custom-lock standalone

    /// Stores a standalone secret protected by a prompted passphrase.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_standalone_custom_lock_secret(
        &self,
        caller_pid: u32,
        request_id: u64,
        storage_plugin_name: &str,
        encryption_plugin_name: &str,
        authentication_plugin_name: &str,
        secret: Secret,
        user_input_params: Option<InteractionParameters>,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        Self::check_standalone_identifier(&secret.identifier)?;
        self.registry
            .resolve_strategy(storage_plugin_name, encryption_plugin_name)?;
        let caller_application_id = self.caller_application_id(caller_pid);
        let hashed_name = hashed_secret_name(RESERVED_COLLECTION_NAME, &secret.identifier.name);

        self.check_existing_standalone(
            caller_pid,
            &secret.identifier.name,
            &hashed_name,
            false,
            storage_plugin_name,
        )?;
        self.check_interaction_allowed(
            authentication_plugin_name,
            user_interaction_mode,
            interaction_service_address,
        )?;

        let Some(ui_params) = user_input_params else {
            return self
                .set_standalone_custom_lock_secret_get_authentication_code(
                    caller_pid,
                    request_id,
                    caller_application_id,
                    storage_plugin_name.to_string(),
                    encryption_plugin_name.to_string(),
                    authentication_plugin_name.to_string(),
                    secret,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    access_control_mode,
                    user_interaction_mode,
                    interaction_service_address,
                )
                .await;
        };

        let plugin = self.user_input_plugin(&ui_params.authentication_plugin_name)?;
        let mut prompt = ui_params;
        prompt.application_id = caller_application_id.clone();
        prompt.secret_name = secret.identifier.name.clone();
        prompt.operation = InteractionOperation::RequestUserData;
        prompt.prompt_text = format!(
            "Enter confidential data for standalone secret {} stored by plugin {}",
            secret.identifier.name, storage_plugin_name
        );
        self.dispatch_prompt(
            plugin,
            caller_pid,
            request_id,
            prompt,
            interaction_service_address,
            Continuation::SetStandaloneCustomLockUserInput {
                secret,
                caller_application_id,
                storage_plugin_name: storage_plugin_name.to_string(),
                encryption_plugin_name: encryption_plugin_name.to_string(),
                authentication_plugin_name: authentication_plugin_name.to_string(),
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control_mode,
                user_interaction_mode,
                interaction_service_address: interaction_service_address.to_string(),
            },
        )
    }

    /// Prompts for the passphrase that will protect a standalone
    /// custom-lock secret.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn set_standalone_custom_lock_secret_get_authentication_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        caller_application_id: String,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        authentication_plugin_name: String,
        secret: Secret,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
        _user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        let plugin = self.user_input_plugin(&authentication_plugin_name)?;
        let prompt = InteractionParameters {
            application_id: caller_application_id,
            collection_name: String::new(),
            secret_name: secret.identifier.name.clone(),
            authentication_plugin_name: authentication_plugin_name.clone(),
            operation: InteractionOperation::StoreSecret,
            input_type: InputType::AlphaNumeric,
            echo_mode: EchoMode::PasswordEchoOnEdit,
            prompt_text: format!(
                "Enter the passphrase to encrypt standalone secret {}",
                secret.identifier.name
            ),
        };
        self.dispatch_prompt(
            plugin,
            caller_pid,
            request_id,
            prompt,
            interaction_service_address,
            Continuation::SetStandaloneCustomLockSecret {
                secret,
                storage_plugin_name,
                encryption_plugin_name,
                authentication_plugin_name,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control_mode,
            },
        )
    }

    /// Continues a standalone custom-lock store once the passphrase is
    /// in hand.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn set_standalone_custom_lock_secret_with_authentication_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        authentication_plugin_name: String,
        secret: Secret,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
        authentication_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        let strategy = self
            .registry
            .resolve_strategy(&storage_plugin_name, &encryption_plugin_name)?;
        let key = self.derive_key(&strategy, authentication_code).await?;
        self.set_standalone_custom_lock_secret_with_encryption_key(
            caller_pid,
            request_id,
            storage_plugin_name,
            encryption_plugin_name,
            authentication_plugin_name,
            secret,
            unlock_semantic,
            custom_lock_timeout_ms,
            access_control_mode,
            key,
        )
        .await
    }

    /// Final phase of a standalone custom-lock store.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn set_standalone_custom_lock_secret_with_encryption_key(
        &self,
        caller_pid: u32,
        _request_id: u64,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        authentication_plugin_name: String,
        secret: Secret,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
        key: DerivedKey,
    ) -> SecretsResult<Outcome> {
        let caller_application_id = self.caller_application_id(caller_pid);
        let hashed_name = hashed_secret_name(RESERVED_COLLECTION_NAME, &secret.identifier.name);

        // check again in case another application wrote the secret while
        // the authentication flow was active
        let existing = self.check_existing_standalone(
            caller_pid,
            &secret.identifier.name,
            &hashed_name,
            false,
            &storage_plugin_name,
        )?;

        let row = SecretMetadata {
            collection_name: RESERVED_COLLECTION_NAME.to_string(),
            hashed_secret_name: hashed_name.clone(),
            application_id: caller_application_id,
            uses_device_lock_key: false,
            storage_plugin_name: storage_plugin_name.clone(),
            encryption_plugin_name: encryption_plugin_name.clone(),
            authentication_plugin_name,
            unlock_semantic,
            custom_lock_timeout_ms,
            access_control_mode,
        };
        if existing.found {
            self.bkdb.update_secret(&row.to_record())?;
        } else {
            self.bkdb.insert_secret(&row.to_record())?;
        }

        let plugin_result = self
            .store_standalone_secret(
                &storage_plugin_name,
                &encryption_plugin_name,
                &secret,
                &hashed_name,
                key.clone(),
            )
            .await;

        match plugin_result {
            Ok(split_strategy) => {
                if split_strategy {
                    self.cache_standalone_key(
                        &hashed_name,
                        key,
                        unlock_semantic,
                        custom_lock_timeout_ms,
                    );
                }
                Ok(Outcome::Completed(Reply::Done))
            }
            Err(plugin_err) if !existing.found => Err(self.cleanup_delete_secret(
                RESERVED_COLLECTION_NAME,
                &hashed_name,
                plugin_err,
            )),
            Err(plugin_err) => Err(plugin_err),
        }
    }

    /// Performs the strategy-appropriate plugin write for a standalone
    /// secret; returns whether the split strategy was used.
    async fn store_standalone_secret(
        &self,
        storage_plugin_name: &str,
        encryption_plugin_name: &str,
        secret: &Secret,
        hashed_name: &str,
        key: DerivedKey,
    ) -> SecretsResult<bool> {
        let strategy = self
            .registry
            .resolve_strategy(storage_plugin_name, encryption_plugin_name)?;
        let mut stored = secret.clone();
        stored.identifier.collection_name = RESERVED_COLLECTION_NAME.to_string();
        match strategy {
            Strategy::Encrypted(plugin) => {
                let hashed = hashed_name.to_string();
                run_blocking(move || {
                    plugin.set_secret(RESERVED_COLLECTION_NAME, &hashed, &stored, &key)
                })
                .await?;
                Ok(false)
            }
            Strategy::Split {
                storage,
                encryption,
            } => {
                let hashed = hashed_name.to_string();
                run_blocking(move || {
                    wrappers::encrypt_and_store_secret(
                        &encryption,
                        &storage,
                        RESERVED_COLLECTION_NAME,
                        &hashed,
                        &stored,
                        &key,
                    )
                })
                .await?;
                Ok(true)
            }
        }
    }

    // Get

    /// Reads a standalone secret.
    pub async fn get_standalone_secret(
        &self,
        caller_pid: u32,
        request_id: u64,
        identifier: SecretIdentifier,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        Self::check_standalone_identifier(&identifier)?;
        let caller_application_id = self.caller_application_id(caller_pid);
        let hashed_name = hashed_secret_name(RESERVED_COLLECTION_NAME, &identifier.name);

        let record = self
            .bkdb
            .secret_metadata(RESERVED_COLLECTION_NAME, &hashed_name)?
            .ok_or_else(|| SecretsError::InvalidSecret("nonexistent secret name given".into()))?;
        let metadata = SecretMetadata::from_record(record)?;
        self.registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;
        if metadata.access_control_mode == AccessControlMode::System {
            return Err(SecretsError::OperationNotSupported(
                "access control requests are not currently supported".into(),
            ));
        }
        if metadata.application_id != caller_application_id {
            return Err(SecretsError::Permissions(format!(
                "secret {} is owned by a different application",
                identifier.name
            )));
        }
        let auth_plugin = self.authentication_plugin(&metadata.authentication_plugin_name)?;
        if auth_plugin.authentication_types().application_specific
            && (user_interaction_mode != UserInteractionMode::ApplicationInteraction
                || interaction_service_address.is_empty())
        {
            return Err(SecretsError::OperationRequiresApplicationUserInteraction(
                format!(
                    "authentication plugin {} requires in-process user interaction",
                    metadata.authentication_plugin_name
                ),
            ));
        }

        let cached_key = self.key_cache.lock().standalone_key(&hashed_name);
        if let Some(key) = cached_key {
            return self
                .get_standalone_secret_with_encryption_key(
                    caller_pid,
                    request_id,
                    identifier,
                    metadata.storage_plugin_name,
                    metadata.encryption_plugin_name,
                    metadata.unlock_semantic,
                    metadata.custom_lock_timeout_ms,
                    key,
                )
                .await;
        }

        if metadata.uses_device_lock_key {
            return Err(SecretsError::CollectionIsLocked(format!(
                "secret {} is locked and requires device lock authentication",
                identifier.name
            )));
        }
        if user_interaction_mode == UserInteractionMode::PreventInteraction {
            return Err(SecretsError::OperationRequiresUserInteraction(format!(
                "authentication plugin {} requires user interaction",
                metadata.authentication_plugin_name
            )));
        }

        let prompt = InteractionParameters {
            application_id: caller_application_id,
            collection_name: String::new(),
            secret_name: identifier.name.clone(),
            authentication_plugin_name: metadata.authentication_plugin_name.clone(),
            operation: InteractionOperation::ReadSecret,
            input_type: InputType::AlphaNumeric,
            echo_mode: EchoMode::PasswordEchoOnEdit,
            prompt_text: format!(
                "Enter the passphrase to decrypt standalone secret {}",
                identifier.name
            ),
        };
        self.dispatch_prompt(
            auth_plugin,
            caller_pid,
            request_id,
            prompt,
            interaction_service_address,
            Continuation::GetStandaloneSecret {
                identifier,
                storage_plugin_name: metadata.storage_plugin_name,
                encryption_plugin_name: metadata.encryption_plugin_name,
                unlock_semantic: metadata.unlock_semantic,
                custom_lock_timeout_ms: metadata.custom_lock_timeout_ms,
            },
        )
    }

    /// Continues a standalone read once the passphrase is in hand.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn get_standalone_secret_with_authentication_code(
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
        self.get_standalone_secret_with_encryption_key(
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

    /// Final phase of a standalone read.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn get_standalone_secret_with_encryption_key(
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
        let hashed_name = hashed_secret_name(RESERVED_COLLECTION_NAME, &identifier.name);

        let mut secret = match strategy {
            Strategy::Encrypted(plugin) => {
                let hashed = hashed_name.clone();
                run_blocking(move || plugin.access_secret(RESERVED_COLLECTION_NAME, &hashed, &key))
                    .await?
            }
            Strategy::Split {
                storage,
                encryption,
            } => {
                let (effective_key, inserted_now) = {
                    let mut cache = self.key_cache.lock();
                    match cache.standalone_key(&hashed_name) {
                        Some(cached) => (cached, false),
                        None => {
                            cache.insert_standalone_key(&hashed_name, key.clone());
                            (key, true)
                        }
                    }
                };
                self.arm_standalone_relock_timer(
                    &hashed_name,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                );
                let hashed = hashed_name.clone();
                let result = run_blocking(move || {
                    wrappers::get_and_decrypt_secret(
                        &encryption,
                        &storage,
                        RESERVED_COLLECTION_NAME,
                        &hashed,
                        &effective_key,
                    )
                })
                .await;
                match result {
                    Ok(secret) => secret,
                    Err(err) => {
                        if inserted_now {
                            self.key_cache.lock().remove_standalone(&hashed_name);
                        }
                        return Err(err);
                    }
                }
            }
        };
        // standalone secrets are addressed without a collection
        secret.identifier.collection_name = String::new();
        Ok(Outcome::Completed(Reply::Secret(secret)))
    }

    // Delete

    /// Deletes a standalone secret.
    pub async fn delete_standalone_secret(
        &self,
        caller_pid: u32,
        _request_id: u64,
        identifier: SecretIdentifier,
        _user_interaction_mode: UserInteractionMode,
    ) -> SecretsResult<Outcome> {
        Self::check_standalone_identifier(&identifier)?;
        let caller_application_id = self.caller_application_id(caller_pid);
        let hashed_name = hashed_secret_name(RESERVED_COLLECTION_NAME, &identifier.name);

        let Some(record) = self
            .bkdb
            .secret_metadata(RESERVED_COLLECTION_NAME, &hashed_name)?
        else {
            // the secret doesn't exist; deleting succeeded
            return Ok(Outcome::Completed(Reply::Done));
        };
        let metadata = SecretMetadata::from_record(record)?;
        if metadata.access_control_mode == AccessControlMode::System {
            return Err(SecretsError::OperationNotSupported(
                "access control requests are not currently supported".into(),
            ));
        }
        if metadata.application_id != caller_application_id {
            return Err(SecretsError::Permissions(format!(
                "secret {} is owned by a different application",
                identifier.name
            )));
        }
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;

        let uses_device_lock_key = metadata.uses_device_lock_key;
        let device_lock_key = self.device_lock_key();
        let split_strategy = matches!(strategy, Strategy::Split { .. });
        let plugin_result = match strategy {
            Strategy::Encrypted(plugin) => {
                let hashed = hashed_name.clone();
                run_blocking(move || {
                    plugin.unlock_and_remove_secret(
                        RESERVED_COLLECTION_NAME,
                        &hashed,
                        uses_device_lock_key,
                        &device_lock_key,
                    )
                })
                .await
            }
            Strategy::Split { storage, .. } => {
                let hashed = hashed_name.clone();
                run_blocking(move || storage.remove_secret(RESERVED_COLLECTION_NAME, &hashed)).await
            }
        };
        plugin_result?;

        if split_strategy {
            self.key_cache.lock().remove_standalone(&hashed_name);
        }
        if let Err(delete_err) = self
            .bkdb
            .delete_secret(RESERVED_COLLECTION_NAME, &hashed_name)
        {
            self.mark_secret_dirty(RESERVED_COLLECTION_NAME, &hashed_name);
            return Err(SecretsError::Database(format!(
                "secret was removed from plugin storage but its bookkeeping row could not be \
                 deleted: {delete_err}"
            )));
        }
        Ok(Outcome::Completed(Reply::Done))
    }

    /// Filtering standalone secrets is deliberately unimplemented.
    pub async fn find_standalone_secrets(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        _filter: crate::types::FilterData,
        _filter_operator: crate::types::FilterOperator,
        _user_interaction_mode: UserInteractionMode,
        _interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        Err(SecretsError::OperationNotSupported(
            "filtering standalone secrets is not yet supported".into(),
        ))
    }

    fn broker_default_authentication_plugin(&self) -> String {
        self.broker.resolve_user_input_plugin("")
    }
}
