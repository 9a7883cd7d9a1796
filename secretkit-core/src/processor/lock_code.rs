//! The lock-code controller: re-key, provide and forget operations for
//! the bookkeeping database and for individual plugins.
//!
//! A database re-key proceeds in strict order: verify the old code,
//! re-encrypt the bookkeeping database, then re-encrypt every
//! device-lock-protected collection and standalone secret, and finally
//! re-key the storage plugins themselves. Failures after the database
//! re-encryption are logged and skipped: the database and surviving
//! items remain consistent, and the affected items stay readable only
//! under the old device lock key until an operator intervenes.

use std::sync::Arc;

use log::{debug, warn};

use crate::error::{SecretsError, SecretsResult};
use crate::lock_state::FORGOTTEN_LOCK_CODE;
use crate::plugin::{wrappers, Strategy};
use crate::types::{
    CollectionMetadata, EchoMode, InputType, InteractionOperation, InteractionParameters,
    LockCodeTarget, Outcome, Reply, SecretMetadata, UnlockSemantic, UserInteractionMode,
    RESERVED_COLLECTION_NAME,
};

use super::{run_blocking, RequestProcessor};

impl RequestProcessor {
    fn check_lock_code_target(
        &self,
        caller_pid: u32,
        target: LockCodeTarget,
        target_name: &str,
        operation: &str,
    ) -> SecretsResult<()> {
        match target {
            LockCodeTarget::StandaloneSecret => Err(SecretsError::OperationNotSupported(format!(
                "{operation} for a standalone secret is not yet supported"
            ))),
            LockCodeTarget::Collection => Err(SecretsError::OperationNotSupported(format!(
                "{operation} for a collection is not yet supported"
            ))),
            LockCodeTarget::ExtensionPlugin => {
                if !self
                    .permissions
                    .application_is_platform_application(caller_pid)
                {
                    return Err(SecretsError::Permissions(
                        "only the platform settings application can change a plugin lock".into(),
                    ));
                }
                Ok(())
            }
            LockCodeTarget::BookkeepingDatabase => {
                if !self
                    .permissions
                    .application_is_platform_application(caller_pid)
                {
                    return Err(SecretsError::Permissions(
                        "only the platform settings application can change the secrets \
                         database lock"
                            .into(),
                    ));
                }
                // there is only one bookkeeping database
                if !target_name.is_empty() {
                    return Err(SecretsError::OperationNotSupported(
                        "invalid target name specified".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Changes the lock code of the database or of a named plugin:
    /// prompts for the old code, then the new one, then re-keys.
    pub async fn modify_lock_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        target: LockCodeTarget,
        target_name: &str,
        interaction_params: InteractionParameters,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        self.check_lock_code_target(caller_pid, target, target_name, "modifying the lock code")?;
        if target == LockCodeTarget::BookkeepingDatabase && self.bkdb.is_locked() {
            return Err(SecretsError::SecretsDaemonLocked(
                "the secrets database must be unlocked before its lock code can be modified"
                    .into(),
            ));
        }

        let plugin = self.user_input_plugin(&interaction_params.authentication_plugin_name)?;
        let mut prompt = interaction_params;
        prompt.application_id = self.caller_application_id(caller_pid);
        prompt.input_type = InputType::AlphaNumeric;
        prompt.echo_mode = EchoMode::PasswordEchoOnEdit;
        if target == LockCodeTarget::ExtensionPlugin {
            prompt.operation = InteractionOperation::ModifyLockPlugin;
            prompt.prompt_text = format!("Enter the old lock code for the plugin: {target_name}");
        } else {
            prompt.operation = InteractionOperation::ModifyLockDatabase;
            prompt.prompt_text = "Enter the old master lock code for device secrets".into();
        }
        self.dispatch_prompt(
            plugin,
            caller_pid,
            request_id,
            prompt.clone(),
            interaction_service_address,
            crate::pending::Continuation::ModifyLockCode {
                target,
                target_name: target_name.to_string(),
                interaction_params: prompt,
                user_interaction_mode,
                interaction_service_address: interaction_service_address.to_string(),
                old_lock_code: None,
            },
        )
    }

    /// With the old code in hand, prompts for the new one.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn modify_lock_code_with_lock_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        target: LockCodeTarget,
        target_name: String,
        interaction_params: InteractionParameters,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
        old_lock_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        let plugin = self.user_input_plugin(&interaction_params.authentication_plugin_name)?;
        let mut prompt = interaction_params;
        if target == LockCodeTarget::ExtensionPlugin {
            prompt.operation = InteractionOperation::ModifyLockPlugin;
            prompt.prompt_text = format!("Enter the new lock code for the plugin: {target_name}");
        } else {
            prompt.operation = InteractionOperation::ModifyLockDatabase;
            prompt.prompt_text = "Enter the new master lock code for device secrets".into();
        }
        self.dispatch_prompt(
            plugin,
            caller_pid,
            request_id,
            prompt.clone(),
            interaction_service_address,
            crate::pending::Continuation::ModifyLockCode {
                target,
                target_name,
                interaction_params: prompt,
                user_interaction_mode,
                interaction_service_address: interaction_service_address.to_string(),
                old_lock_code: Some(old_lock_code),
            },
        )
    }

    /// With both codes in hand, performs the re-key.
    pub(crate) async fn modify_lock_code_with_lock_codes(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        target: LockCodeTarget,
        target_name: String,
        old_lock_code: Vec<u8>,
        new_lock_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        if target == LockCodeTarget::ExtensionPlugin {
            let Some(plugin) = wrappers::find_lock_target_plugin(&self.registry, &target_name)
            else {
                return Err(SecretsError::InvalidExtensionPlugin(format!(
                    "no such plugin to re-key: {target_name}"
                )));
            };
            let name = target_name.clone();
            run_blocking(move || {
                wrappers::apply_lock_op(
                    &name,
                    plugin.supports_locking(),
                    plugin.set_lock_code(&old_lock_code, &new_lock_code),
                    "re-key",
                )
            })
            .await?;
            return Ok(Outcome::Completed(Reply::Done));
        }

        // otherwise: the master lock code for the bookkeeping database
        if self.bkdb.is_locked() {
            return Err(SecretsError::SecretsDaemonLocked(
                "the secrets database must be unlocked before its lock code can be modified"
                    .into(),
            ));
        }
        if !self.lock_state.lock().test_lock_code(&old_lock_code) {
            return Err(SecretsError::SecretsDaemonLocked(
                "the given old lock code was incorrect".into(),
            ));
        }

        // snapshot the outgoing key material before re-initialising
        let (old_bkdb_key, old_device_key) = {
            let state = self.lock_state.lock();
            (
                state.bkdb_lock_key().clone(),
                state.device_lock_key().clone(),
            )
        };

        {
            let mut state = self.lock_state.lock();
            state.initialise(&new_lock_code)?;
        }
        let (new_bkdb_key, new_device_key) = {
            let state = self.lock_state.lock();
            (
                state.bkdb_lock_key().clone(),
                state.device_lock_key().clone(),
            )
        };

        if let Err(reencrypt_err) = self
            .bkdb
            .reencrypt(old_bkdb_key.as_bytes(), new_bkdb_key.as_bytes())
        {
            // restore the previous key material before failing
            self.lock_state.lock().initialise(&old_lock_code)?;
            return Err(reencrypt_err.into());
        }
        self.lock_state
            .lock()
            .set_no_lock_code(new_lock_code.is_empty());

        // The database is re-keyed. Re-encrypt every device-locked item;
        // failures from here on are logged and skipped, leaving the
        // affected item readable only under the old device lock key.
        self.reencrypt_device_locked_collections(&old_device_key, &new_device_key)
            .await;
        self.reencrypt_device_locked_standalone_secrets(&old_device_key, &new_device_key)
            .await;

        let storage_plugins = self.registry.all_storage();
        let encrypted_storage_plugins = self.registry.all_encrypted_storage();
        let old_key = old_device_key;
        let new_key = new_device_key;
        let _ = run_blocking(move || {
            wrappers::modify_master_lock_plugins(
                &storage_plugins,
                &encrypted_storage_plugins,
                &old_key,
                &new_key,
            );
            Ok(())
        })
        .await;

        Ok(Outcome::Completed(Reply::Done))
    }

    async fn reencrypt_device_locked_collections(
        &self,
        old_device_key: &crate::key::DerivedKey,
        new_device_key: &crate::key::DerivedKey,
    ) {
        let collection_names = match self.bkdb.collection_names() {
            Ok(names) => names,
            Err(err) => {
                warn!("failed to list collections for re-encryption: {err}");
                return;
            }
        };
        for collection_name in collection_names {
            let metadata = match self.bkdb.collection_metadata(&collection_name) {
                Ok(Some(record)) => match CollectionMetadata::from_record(record) {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!("corrupt metadata for collection {collection_name}: {err}");
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        "failed to retrieve metadata for collection {collection_name} for \
                         re-encryption: {err}"
                    );
                    continue;
                }
            };
            if !metadata.uses_device_lock_key {
                continue;
            }
            let strategy = match self
                .registry
                .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)
            {
                Ok(strategy) => strategy,
                Err(err) => {
                    warn!("invalid plugin in metadata for collection {collection_name}: {err}");
                    continue;
                }
            };

            let result = match &strategy {
                Strategy::Encrypted(plugin) => {
                    let plugin = Arc::clone(plugin);
                    let name = collection_name.clone();
                    let old_key = old_device_key.clone();
                    let new_key = new_device_key.clone();
                    run_blocking(move || {
                        plugin.unlock_collection_and_reencrypt(&name, &old_key, &new_key, true)
                    })
                    .await
                }
                Strategy::Split {
                    storage,
                    encryption,
                } => {
                    let storage = Arc::clone(storage);
                    let encryption = Arc::clone(encryption);
                    let name = collection_name.clone();
                    let old_key = old_device_key.clone();
                    let new_key = new_device_key.clone();
                    run_blocking(move || {
                        storage.reencrypt_secrets(
                            &name,
                            &[],
                            &old_key,
                            &new_key,
                            encryption.as_ref(),
                        )
                    })
                    .await
                }
            };
            match result {
                Ok(()) => {
                    // refresh any resident key so the collection stays
                    // readable under the new device lock
                    let mut cache = self.key_cache.lock();
                    if cache.contains_collection(&collection_name) {
                        cache.remove_collection(&collection_name);
                        cache.insert_collection_key(&collection_name, new_device_key.clone());
                    }
                }
                Err(err) => {
                    warn!(
                        "failed to re-encrypt device-locked collection {collection_name}: {err}"
                    );
                }
            }
        }
    }

    async fn reencrypt_device_locked_standalone_secrets(
        &self,
        old_device_key: &crate::key::DerivedKey,
        new_device_key: &crate::key::DerivedKey,
    ) {
        let hashed_names = match self.bkdb.hashed_secret_names(RESERVED_COLLECTION_NAME) {
            Ok(names) => names,
            Err(err) => {
                warn!("failed to retrieve standalone secret names for re-encryption: {err}");
                return;
            }
        };
        for hashed_name in hashed_names {
            let metadata = match self
                .bkdb
                .secret_metadata(RESERVED_COLLECTION_NAME, &hashed_name)
            {
                Ok(Some(record)) => match SecretMetadata::from_record(record) {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!("corrupt metadata for standalone secret {hashed_name}: {err}");
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        "failed to retrieve metadata for standalone secret {hashed_name} for \
                         re-encryption: {err}"
                    );
                    continue;
                }
            };
            if !metadata.uses_device_lock_key {
                continue;
            }
            let strategy = match self
                .registry
                .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)
            {
                Ok(strategy) => strategy,
                Err(err) => {
                    warn!("invalid plugin in metadata for standalone secret {hashed_name}: {err}");
                    continue;
                }
            };
            match strategy {
                Strategy::Encrypted(_) => {
                    // the combined plugin re-keys its own standalone
                    // payloads during the master plugin re-key pass
                    debug!(
                        "standalone secret {hashed_name} is re-keyed by its encrypted \
                         storage plugin"
                    );
                }
                Strategy::Split {
                    storage,
                    encryption,
                } => {
                    let hashed = hashed_name.clone();
                    let old_key = old_device_key.clone();
                    let new_key = new_device_key.clone();
                    let result = run_blocking(move || {
                        storage.reencrypt_secrets(
                            "",
                            &[hashed],
                            &old_key,
                            &new_key,
                            encryption.as_ref(),
                        )
                    })
                    .await;
                    match result {
                        Ok(()) => {
                            let mut cache = self.key_cache.lock();
                            if cache.contains_standalone(&hashed_name) {
                                cache.remove_standalone(&hashed_name);
                                cache
                                    .insert_standalone_key(&hashed_name, new_device_key.clone());
                            }
                        }
                        Err(err) => {
                            warn!(
                                "failed to re-encrypt device-locked standalone secret \
                                 {hashed_name}: {err}"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Provides the lock code for the database or a named plugin,
    /// unlocking it.
    pub async fn provide_lock_code(
        &self,
        caller_pid: u32,
        request_id: u64,
        target: LockCodeTarget,
        target_name: &str,
        interaction_params: InteractionParameters,
        _user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        self.check_lock_code_target(caller_pid, target, target_name, "providing the lock code")?;

        if target == LockCodeTarget::BookkeepingDatabase {
            if !self.bkdb.is_locked() {
                return Err(SecretsError::unknown("the secrets database is not locked"));
            }
            if self.lock_state.lock().no_lock_code() {
                // opened without a code at boot and not re-keyed since;
                // unlock with the null code, no prompt needed
                {
                    let mut state = self.lock_state.lock();
                    state.initialise(b"")?;
                }
                let key = self.lock_state.lock().bkdb_lock_key().clone();
                self.bkdb.unlock(key.as_bytes())?;
                self.master_unlock_all_plugins().await;
                return Ok(Outcome::Completed(Reply::Done));
            }
        }

        let plugin = self.user_input_plugin(&interaction_params.authentication_plugin_name)?;
        let mut prompt = interaction_params;
        prompt.application_id = self.caller_application_id(caller_pid);
        prompt.input_type = InputType::AlphaNumeric;
        prompt.echo_mode = EchoMode::PasswordEchoOnEdit;
        if target == LockCodeTarget::ExtensionPlugin {
            prompt.operation = InteractionOperation::UnlockPlugin;
            prompt.prompt_text = format!("Provide the unlock code for the plugin {target_name}");
        } else {
            prompt.operation = InteractionOperation::UnlockDatabase;
            prompt.prompt_text = "Provide the master unlock code for device secrets".into();
        }
        self.dispatch_prompt(
            plugin,
            caller_pid,
            request_id,
            prompt,
            interaction_service_address,
            crate::pending::Continuation::ProvideLockCode {
                target,
                target_name: target_name.to_string(),
            },
        )
    }

    /// With the code in hand, unlocks the target.
    pub(crate) async fn provide_lock_code_with_lock_code(
        &self,
        _caller_pid: u32,
        _request_id: u64,
        target: LockCodeTarget,
        target_name: String,
        lock_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        if target == LockCodeTarget::ExtensionPlugin {
            let Some(plugin) = wrappers::find_lock_target_plugin(&self.registry, &target_name)
            else {
                return Err(SecretsError::InvalidExtensionPlugin(format!(
                    "no such plugin to unlock: {target_name}"
                )));
            };
            let name = target_name.clone();
            run_blocking(move || {
                wrappers::apply_lock_op(
                    &name,
                    plugin.supports_locking(),
                    plugin.unlock(&lock_code),
                    "unlock",
                )
            })
            .await?;
            return Ok(Outcome::Completed(Reply::Done));
        }

        {
            let mut state = self.lock_state.lock();
            state.initialise(&lock_code)?;
        }
        let key = self.lock_state.lock().bkdb_lock_key().clone();
        self.bkdb.unlock(key.as_bytes())?;
        self.master_unlock_all_plugins().await;
        Ok(Outcome::Completed(Reply::Done))
    }

    /// Forgets the lock code: key material is reset to the sentinel, the
    /// database and all storage plugins are locked.
    pub async fn forget_lock_code(
        &self,
        caller_pid: u32,
        _request_id: u64,
        target: LockCodeTarget,
        target_name: &str,
        _interaction_params: InteractionParameters,
        _user_interaction_mode: UserInteractionMode,
        _interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        self.check_lock_code_target(caller_pid, target, target_name, "forgetting the lock code")?;

        if target == LockCodeTarget::ExtensionPlugin {
            let Some(plugin) = wrappers::find_lock_target_plugin(&self.registry, target_name)
            else {
                return Err(SecretsError::InvalidExtensionPlugin(format!(
                    "no such plugin to lock: {target_name}"
                )));
            };
            let name = target_name.to_string();
            run_blocking(move || {
                wrappers::apply_lock_op(&name, plugin.supports_locking(), plugin.lock(), "lock")
            })
            .await?;
            return Ok(Outcome::Completed(Reply::Done));
        }

        {
            let mut state = self.lock_state.lock();
            state.initialise(FORGOTTEN_LOCK_CODE)?;
        }
        self.bkdb.lock();

        let storage_plugins = self.registry.all_storage();
        let encrypted_storage_plugins = self.registry.all_encrypted_storage();
        let _ = run_blocking(move || {
            wrappers::master_lock_plugins(&storage_plugins, &encrypted_storage_plugins);
            Ok(())
        })
        .await;
        Ok(Outcome::Completed(Reply::Done))
    }

    /// Propagates a device-lock event: evicts every cached key whose
    /// item relocks on device lock (or is device-lock protected) and
    /// locks the storage plugins.
    pub async fn relock_device_locked_items(&self) {
        let cached_collections = self.key_cache.lock().cached_collection_names();
        for collection_name in cached_collections {
            let should_relock = match self.bkdb.collection_metadata(&collection_name) {
                Ok(Some(record)) => match CollectionMetadata::from_record(record) {
                    Ok(metadata) => {
                        metadata.uses_device_lock_key
                            || metadata.unlock_semantic == UnlockSemantic::RelockOnDeviceLock
                    }
                    Err(_) => true,
                },
                // evict when in doubt: holding a key too long is the
                // worse failure
                _ => true,
            };
            if should_relock {
                self.key_cache.lock().remove_collection(&collection_name);
            }
        }

        let cached_standalone = self.key_cache.lock().cached_standalone_names();
        for hashed_name in cached_standalone {
            let should_relock = match self
                .bkdb
                .secret_metadata(RESERVED_COLLECTION_NAME, &hashed_name)
            {
                Ok(Some(record)) => match SecretMetadata::from_record(record) {
                    Ok(metadata) => {
                        metadata.uses_device_lock_key
                            || metadata.unlock_semantic == UnlockSemantic::RelockOnDeviceLock
                    }
                    Err(_) => true,
                },
                _ => true,
            };
            if should_relock {
                self.key_cache.lock().remove_standalone(&hashed_name);
            }
        }

        let storage_plugins = self.registry.all_storage();
        let encrypted_storage_plugins = self.registry.all_encrypted_storage();
        let _ = run_blocking(move || {
            wrappers::master_lock_plugins(&storage_plugins, &encrypted_storage_plugins);
            Ok(())
        })
        .await;
    }

    async fn master_unlock_all_plugins(&self) {
        let storage_plugins = self.registry.all_storage();
        let encrypted_storage_plugins = self.registry.all_encrypted_storage();
        let device_lock_key = self.device_lock_key();
        let _ = run_blocking(move || {
            wrappers::master_unlock_plugins(
                &storage_plugins,
                &encrypted_storage_plugins,
                &device_lock_key,
            );
            Ok(())
        })
        .await;
    }
}
