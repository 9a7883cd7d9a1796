//! The request processor: entry point for every client request.
//!
//! Each operation validates the request against collection/secret
//! metadata and access-control policy, then drives the multi-step
//! protocol between bookkeeping, key derivation, user prompting and
//! plugin I/O. Blocking plugin and KDF calls run on the worker pool and
//! are awaited; user prompts suspend the request into the pending table
//! and resume through [`RequestProcessor::user_input_interaction_completed`].
//!
//! Ordering contract for bookkeeping + plugin mutations: on create, the
//! metadata row is committed before the plugin mutates, and a failed
//! plugin call is compensated by deleting the row; on delete, the plugin
//! destroys storage first and the row is removed afterwards. Only the
//! bookkeeping side is ever allowed to be wrong, because it can be
//! corrected; an orphaned plugin collection cannot be reliably detected.

mod lock_code;
mod secrets;
mod standalone;

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use tokio::sync::mpsc;
use tokio::task;

use secretkit_db::{BookkeepingDb, DbError};

use crate::cache::KeyCache;
use crate::error::{SecretsError, SecretsResult};
use crate::guard::InterleaveGuard;
use crate::interaction::InteractionBroker;
use crate::key::DerivedKey;
use crate::lock_state::LockState;
use crate::pending::{Continuation, PendingRequest, PendingRequestTable};
use crate::permissions::ApplicationPermissions;
use crate::plugin::{AuthenticationPlugin, PluginRegistry, Strategy};
use crate::types::{
    is_reserved_collection_name, AccessControlMode, CollectionMetadata, EchoMode, InputType,
    InteractionOperation, InteractionParameters, Outcome, PluginInfoReport, Reply,
    RequestFinished, SecretIdentifier, UnlockSemantic, UserInteractionMode,
};

/// The daemon core. Owns all in-memory unlock state and orchestrates
/// every request.
pub struct RequestProcessor {
    weak: Weak<RequestProcessor>,
    bkdb: Arc<BookkeepingDb>,
    registry: PluginRegistry,
    broker: InteractionBroker,
    permissions: Arc<dyn ApplicationPermissions>,
    lock_state: Mutex<LockState>,
    key_cache: Mutex<KeyCache>,
    guard: InterleaveGuard,
    pending: Mutex<PendingRequestTable>,
    dirty_collections: Mutex<HashSet<String>>,
    dirty_secrets: Mutex<HashSet<(String, String)>>,
    finished_tx: mpsc::UnboundedSender<RequestFinished>,
}

impl RequestProcessor {
    /// Creates the processor over an opened bookkeeping database and a
    /// populated plugin registry.
    ///
    /// The process salt is loaded (or created) from the database, and a
    /// boot probe attempts to open the database with the empty lock
    /// code; success sets the "no lock code" flag so `provide_lock_code`
    /// can later unlock without prompting.
    ///
    /// # Errors
    ///
    /// Returns an error if the salt cannot be loaded or key material
    /// cannot be derived.
    pub fn new(
        bkdb: Arc<BookkeepingDb>,
        registry: PluginRegistry,
        permissions: Arc<dyn ApplicationPermissions>,
        autotest_mode: bool,
        finished_tx: mpsc::UnboundedSender<RequestFinished>,
    ) -> SecretsResult<Arc<Self>> {
        let salt = bkdb.load_or_create_salt(|| {
            let mut salt = vec![0u8; 16];
            OsRng.fill_bytes(&mut salt);
            salt
        })?;
        let mut lock_state = LockState::new(salt)?;

        let opened_without_code = bkdb.unlock(lock_state.bkdb_lock_key().as_bytes()).is_ok();
        lock_state.set_no_lock_code(opened_without_code);
        if !opened_without_code {
            debug!("bookkeeping database requires a lock code; waiting for provide_lock_code");
        }

        debug!(
            "using the following authentication plugins: {:?}",
            registry.authentication_names()
        );

        let processor = Arc::new_cyclic(|weak: &Weak<RequestProcessor>| Self {
            weak: weak.clone(),
            bkdb,
            registry,
            broker: InteractionBroker::new(autotest_mode),
            permissions,
            lock_state: Mutex::new(lock_state),
            key_cache: Mutex::new(KeyCache::new()),
            guard: InterleaveGuard::new(),
            pending: Mutex::new(PendingRequestTable::new()),
            dirty_collections: Mutex::new(HashSet::new()),
            dirty_secrets: Mutex::new(HashSet::new()),
            finished_tx,
        });
        processor.broker.connect(Arc::downgrade(&processor));
        Ok(processor)
    }

    /// The plugin registry this processor resolves against.
    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Collections whose bookkeeping rows failed compensation and await
    /// operator reconciliation.
    #[must_use]
    pub fn dirty_collections(&self) -> Vec<String> {
        self.dirty_collections.lock().iter().cloned().collect()
    }

    /// `(collection, hashed name)` pairs whose bookkeeping rows failed
    /// compensation and await operator reconciliation.
    #[must_use]
    pub fn dirty_secrets(&self) -> Vec<(String, String)> {
        self.dirty_secrets.lock().iter().cloned().collect()
    }

    // Getters

    /// Lists descriptors of every loaded plugin, per kind.
    pub async fn get_plugin_info(&self, _caller_pid: u32) -> SecretsResult<PluginInfoReport> {
        Ok(self.registry.plugin_info_report())
    }

    /// Lists the names of all collections.
    pub async fn collection_names(&self, _caller_pid: u32) -> SecretsResult<Vec<String>> {
        Ok(self.bkdb.collection_names()?)
    }

    // Collection lifecycle

    /// Creates a device-lock-protected collection.
    pub async fn create_device_lock_collection(
        &self,
        caller_pid: u32,
        _request_id: u64,
        collection_name: &str,
        storage_plugin_name: &str,
        encryption_plugin_name: &str,
        unlock_semantic: UnlockSemantic,
        access_control_mode: AccessControlMode,
    ) -> SecretsResult<Outcome> {
        check_collection_name(collection_name)?;
        let strategy = self
            .registry
            .resolve_strategy(storage_plugin_name, encryption_plugin_name)?;
        let caller_application_id = self.caller_application_id(caller_pid);

        if self.bkdb.collection_exists(collection_name)? {
            return Err(SecretsError::CollectionAlreadyExists(
                collection_name.to_string(),
            ));
        }

        let _token = self.guard.try_acquire(collection_name)?;

        let metadata = CollectionMetadata {
            collection_name: collection_name.to_string(),
            application_id: caller_application_id,
            uses_device_lock_key: true,
            storage_plugin_name: storage_plugin_name.to_string(),
            encryption_plugin_name: encryption_plugin_name.to_string(),
            authentication_plugin_name: self.broker.resolve_user_input_plugin(""),
            unlock_semantic,
            custom_lock_timeout_ms: 0,
            access_control_mode,
        };
        self.insert_collection_row(&metadata)?;

        let device_lock_key = self.device_lock_key();
        let plugin_result = match &strategy {
            Strategy::Encrypted(plugin) => {
                let plugin = Arc::clone(plugin);
                let name = collection_name.to_string();
                let key = device_lock_key.clone();
                run_blocking(move || plugin.create_collection(&name, &key)).await
            }
            Strategy::Split { storage, .. } => {
                let storage = Arc::clone(storage);
                let name = collection_name.to_string();
                run_blocking(move || storage.create_collection(&name)).await
            }
        };

        if let Err(plugin_err) = plugin_result {
            return Err(self.cleanup_delete_collection(collection_name, plugin_err));
        }
        if matches!(strategy, Strategy::Split { .. }) {
            self.cache_collection_key(&metadata, device_lock_key);
        }
        Ok(Outcome::Completed(Reply::Done))
    }

    /// Creates a custom-lock-protected collection: prompts for the
    /// passphrase that will protect it, then continues in
    /// [`Self::create_custom_lock_collection_with_authentication_code`].
    #[allow(clippy::too_many_arguments)]
    pub async fn create_custom_lock_collection(
        &self,
        caller_pid: u32,
        request_id: u64,
        collection_name: &str,
        storage_plugin_name: &str,
        encryption_plugin_name: &str,
        authentication_plugin_name: &str,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<Outcome> {
        check_collection_name(collection_name)?;
        self.registry
            .resolve_strategy(storage_plugin_name, encryption_plugin_name)?;
        let auth_plugin = self.authentication_plugin(authentication_plugin_name)?;
        self.check_interaction_allowed(
            authentication_plugin_name,
            user_interaction_mode,
            interaction_service_address,
        )?;
        let caller_application_id = self.caller_application_id(caller_pid);

        if self.bkdb.collection_exists(collection_name)? {
            return Err(SecretsError::CollectionAlreadyExists(
                collection_name.to_string(),
            ));
        }

        let prompt = InteractionParameters {
            application_id: caller_application_id,
            collection_name: collection_name.to_string(),
            secret_name: String::new(),
            authentication_plugin_name: authentication_plugin_name.to_string(),
            operation: InteractionOperation::CreateCollection,
            input_type: InputType::AlphaNumeric,
            echo_mode: EchoMode::PasswordEchoOnEdit,
            prompt_text: format!(
                "Enter the passphrase which will be used to encrypt the new collection \
                 {collection_name} in plugin {storage_plugin_name}"
            ),
        };
        self.dispatch_prompt(
            auth_plugin,
            caller_pid,
            request_id,
            prompt,
            interaction_service_address,
            Continuation::CreateCustomLockCollection {
                collection_name: collection_name.to_string(),
                storage_plugin_name: storage_plugin_name.to_string(),
                encryption_plugin_name: encryption_plugin_name.to_string(),
                authentication_plugin_name: authentication_plugin_name.to_string(),
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control_mode,
            },
        )
    }

    /// Continues a custom-lock collection create once the passphrase is
    /// in hand: re-checks existence, inserts the metadata row, derives
    /// the key and performs the plugin create.
    #[allow(clippy::too_many_arguments)]
    async fn create_custom_lock_collection_with_authentication_code(
        &self,
        caller_pid: u32,
        _request_id: u64,
        collection_name: String,
        storage_plugin_name: String,
        encryption_plugin_name: String,
        authentication_plugin_name: String,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control_mode: AccessControlMode,
        authentication_code: Vec<u8>,
    ) -> SecretsResult<Outcome> {
        let caller_application_id = self.caller_application_id(caller_pid);

        // another request may have created it during the prompt
        if self.bkdb.collection_exists(&collection_name)? {
            return Err(SecretsError::CollectionAlreadyExists(collection_name));
        }

        let _token = self.guard.try_acquire(&collection_name)?;

        let strategy = self
            .registry
            .resolve_strategy(&storage_plugin_name, &encryption_plugin_name)?;

        let metadata = CollectionMetadata {
            collection_name: collection_name.clone(),
            application_id: caller_application_id,
            uses_device_lock_key: false,
            storage_plugin_name: storage_plugin_name.clone(),
            encryption_plugin_name: encryption_plugin_name.clone(),
            authentication_plugin_name,
            unlock_semantic,
            custom_lock_timeout_ms,
            access_control_mode,
        };
        self.insert_collection_row(&metadata)?;

        let key = match self.derive_key(&strategy, authentication_code).await {
            Ok(key) => key,
            Err(err) => {
                return Err(self.cleanup_delete_collection(&collection_name, err));
            }
        };

        let plugin_result = match &strategy {
            Strategy::Encrypted(plugin) => {
                let plugin = Arc::clone(plugin);
                let name = collection_name.clone();
                let key = key.clone();
                run_blocking(move || plugin.create_collection(&name, &key)).await
            }
            Strategy::Split { storage, .. } => {
                let storage = Arc::clone(storage);
                let name = collection_name.clone();
                run_blocking(move || storage.create_collection(&name)).await
            }
        };

        if let Err(plugin_err) = plugin_result {
            return Err(self.cleanup_delete_collection(&collection_name, plugin_err));
        }
        if matches!(strategy, Strategy::Split { .. }) {
            self.cache_collection_key(&metadata, key);
        }
        Ok(Outcome::Completed(Reply::Done))
    }

    /// Deletes a collection: the plugin destroys storage first, then the
    /// metadata row is removed.
    pub async fn delete_collection(
        &self,
        caller_pid: u32,
        _request_id: u64,
        collection_name: &str,
        _user_interaction_mode: UserInteractionMode,
    ) -> SecretsResult<Outcome> {
        check_collection_name(collection_name)?;

        let record = match self.bkdb.collection_metadata(collection_name)? {
            Some(record) => record,
            // no such collection, so "deleting" succeeded
            None => return Ok(Outcome::Completed(Reply::Done)),
        };
        let metadata = CollectionMetadata::from_record(record)?;
        self.check_collection_access(caller_pid, &metadata)?;
        let strategy = self
            .registry
            .resolve_strategy(&metadata.storage_plugin_name, &metadata.encryption_plugin_name)?;

        let _token = self.guard.try_acquire(collection_name)?;

        let plugin_result = match &strategy {
            Strategy::Encrypted(plugin) => {
                let plugin = Arc::clone(plugin);
                let name = collection_name.to_string();
                run_blocking(move || plugin.remove_collection(&name)).await
            }
            Strategy::Split { storage, .. } => {
                let storage = Arc::clone(storage);
                let name = collection_name.to_string();
                run_blocking(move || storage.remove_collection(&name)).await
            }
        };
        plugin_result?;

        self.key_cache.lock().remove_collection(collection_name);
        if let Err(delete_err) = self.bkdb.delete_collection(collection_name) {
            self.mark_collection_dirty(collection_name);
            return Err(SecretsError::Database(format!(
                "collection {collection_name} was removed from plugin storage but its \
                 bookkeeping row could not be deleted: {delete_err}"
            )));
        }
        Ok(Outcome::Completed(Reply::Done))
    }

    // Continuation dispatch

    /// Resumes the request suspended under `request_id` with the outcome
    /// of its user interaction.
    ///
    /// The pending entry is removed in every case; a failed or cancelled
    /// interaction propagates its failure to the finished channel.
    pub async fn user_input_interaction_completed(
        &self,
        _caller_pid: u32,
        request_id: u64,
        interaction_result: SecretsResult<Vec<u8>>,
    ) {
        let Some(pending) = self.pending.lock().take(request_id) else {
            self.finish(
                request_id,
                Err(SecretsError::unknown(
                    "no pending request for completed interaction",
                )),
            );
            return;
        };

        let user_input = match interaction_result {
            Ok(user_input) => user_input,
            Err(err) => {
                self.finish(request_id, Err(err));
                return;
            }
        };

        let caller_pid = pending.caller_pid;
        let outcome = match pending.continuation {
            Continuation::CreateCustomLockCollection {
                collection_name,
                storage_plugin_name,
                encryption_plugin_name,
                authentication_plugin_name,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control_mode,
            } => {
                self.create_custom_lock_collection_with_authentication_code(
                    caller_pid,
                    request_id,
                    collection_name,
                    storage_plugin_name,
                    encryption_plugin_name,
                    authentication_plugin_name,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    access_control_mode,
                    user_input,
                )
                .await
            }
            Continuation::SetCollectionSecretUserInput {
                mut secret,
                user_interaction_mode,
                interaction_service_address,
                collection,
            } => {
                // the user supplied the secret data, not a passphrase
                secret.data = user_input;
                self.set_collection_secret_get_authentication_code(
                    caller_pid,
                    request_id,
                    secret,
                    user_interaction_mode,
                    &interaction_service_address,
                    collection,
                )
                .await
            }
            Continuation::SetCollectionSecret { secret, collection } => {
                self.set_collection_secret_with_authentication_code(
                    caller_pid, request_id, secret, collection, user_input,
                )
                .await
            }
            Continuation::WriteStandaloneDeviceLockSecret {
                mut secret,
                caller_application_id,
                storage_plugin_name,
                encryption_plugin_name,
                hashed_secret_name,
                already_exists,
                unlock_semantic,
                access_control_mode,
            } => {
                secret.data = user_input;
                self.write_standalone_device_lock_secret(
                    caller_pid,
                    request_id,
                    caller_application_id,
                    storage_plugin_name,
                    encryption_plugin_name,
                    secret,
                    hashed_secret_name,
                    already_exists,
                    unlock_semantic,
                    access_control_mode,
                )
                .await
            }
            Continuation::SetStandaloneCustomLockUserInput {
                mut secret,
                caller_application_id,
                storage_plugin_name,
                encryption_plugin_name,
                authentication_plugin_name,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control_mode,
                user_interaction_mode,
                interaction_service_address,
            } => {
                secret.data = user_input;
                self.set_standalone_custom_lock_secret_get_authentication_code(
                    caller_pid,
                    request_id,
                    caller_application_id,
                    storage_plugin_name,
                    encryption_plugin_name,
                    authentication_plugin_name,
                    secret,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    access_control_mode,
                    user_interaction_mode,
                    &interaction_service_address,
                )
                .await
            }
            Continuation::SetStandaloneCustomLockSecret {
                secret,
                storage_plugin_name,
                encryption_plugin_name,
                authentication_plugin_name,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control_mode,
            } => {
                self.set_standalone_custom_lock_secret_with_authentication_code(
                    caller_pid,
                    request_id,
                    storage_plugin_name,
                    encryption_plugin_name,
                    authentication_plugin_name,
                    secret,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    access_control_mode,
                    user_input,
                )
                .await
            }
            Continuation::GetCollectionSecret {
                identifier,
                storage_plugin_name,
                encryption_plugin_name,
                unlock_semantic,
                custom_lock_timeout_ms,
            } => {
                self.get_collection_secret_with_authentication_code(
                    caller_pid,
                    request_id,
                    identifier,
                    storage_plugin_name,
                    encryption_plugin_name,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    user_input,
                )
                .await
            }
            Continuation::GetStandaloneSecret {
                identifier,
                storage_plugin_name,
                encryption_plugin_name,
                unlock_semantic,
                custom_lock_timeout_ms,
            } => {
                self.get_standalone_secret_with_authentication_code(
                    caller_pid,
                    request_id,
                    identifier,
                    storage_plugin_name,
                    encryption_plugin_name,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    user_input,
                )
                .await
            }
            Continuation::FindCollectionSecrets {
                collection_name,
                filter,
                filter_operator,
                storage_plugin_name,
                encryption_plugin_name,
                unlock_semantic,
                custom_lock_timeout_ms,
            } => {
                self.find_collection_secrets_with_authentication_code(
                    caller_pid,
                    request_id,
                    collection_name,
                    filter,
                    filter_operator,
                    storage_plugin_name,
                    encryption_plugin_name,
                    unlock_semantic,
                    custom_lock_timeout_ms,
                    user_input,
                )
                .await
            }
            Continuation::DeleteCollectionSecret {
                identifier,
                storage_plugin_name,
                encryption_plugin_name,
            } => {
                self.delete_collection_secret_with_authentication_code(
                    caller_pid,
                    request_id,
                    identifier,
                    storage_plugin_name,
                    encryption_plugin_name,
                    user_input,
                )
                .await
            }
            Continuation::ModifyLockCode {
                target,
                target_name,
                interaction_params,
                user_interaction_mode,
                interaction_service_address,
                old_lock_code,
            } => match old_lock_code {
                None => {
                    // the old code is in hand; prompt for the new one
                    self.modify_lock_code_with_lock_code(
                        caller_pid,
                        request_id,
                        target,
                        target_name,
                        interaction_params,
                        user_interaction_mode,
                        &interaction_service_address,
                        user_input,
                    )
                    .await
                }
                Some(old_code) => {
                    self.modify_lock_code_with_lock_codes(
                        caller_pid, request_id, target, target_name, old_code, user_input,
                    )
                    .await
                }
            },
            Continuation::ProvideLockCode {
                target,
                target_name,
            } => {
                self.provide_lock_code_with_lock_code(
                    caller_pid, request_id, target, target_name, user_input,
                )
                .await
            }
            Continuation::UserInput => Ok(Outcome::Completed(Reply::UserInput(user_input))),
        };

        match outcome {
            Ok(Outcome::Completed(reply)) => self.finish(request_id, Ok(reply)),
            Ok(Outcome::Pending) => {}
            Err(err) => self.finish(request_id, Err(err)),
        }
    }

    // Shared helpers

    pub(crate) fn caller_application_id(&self, caller_pid: u32) -> String {
        if self.permissions.application_is_platform_application(caller_pid) {
            self.permissions.platform_application_id()
        } else {
            self.permissions.application_id(caller_pid)
        }
    }

    pub(crate) fn finish(&self, request_id: u64, result: SecretsResult<Reply>) {
        let _ = self.finished_tx.send(RequestFinished { request_id, result });
    }

    fn authentication_plugin(
        &self,
        plugin_name: &str,
    ) -> SecretsResult<Arc<dyn AuthenticationPlugin>> {
        self.registry.authentication(plugin_name).ok_or_else(|| {
            SecretsError::InvalidExtensionPlugin(format!(
                "no such authentication plugin exists: {plugin_name}"
            ))
        })
    }

    /// Rejects the request when the authentication plugin's interaction
    /// requirements and the caller's interaction mode are incompatible.
    pub(crate) fn check_interaction_allowed(
        &self,
        authentication_plugin_name: &str,
        user_interaction_mode: UserInteractionMode,
        interaction_service_address: &str,
    ) -> SecretsResult<()> {
        let plugin = self.authentication_plugin(authentication_plugin_name)?;
        if plugin.authentication_types().application_specific
            && (user_interaction_mode != UserInteractionMode::ApplicationInteraction
                || interaction_service_address.is_empty())
        {
            return Err(SecretsError::OperationRequiresApplicationUserInteraction(
                format!(
                    "authentication plugin {authentication_plugin_name} requires in-process \
                     user interaction"
                ),
            ));
        }
        if user_interaction_mode == UserInteractionMode::PreventInteraction {
            return Err(SecretsError::OperationRequiresUserInteraction(format!(
                "authentication plugin {authentication_plugin_name} requires user interaction"
            )));
        }
        Ok(())
    }

    /// Loads a collection's metadata and enforces access control.
    pub(crate) fn validated_collection_metadata(
        &self,
        caller_pid: u32,
        collection_name: &str,
    ) -> SecretsResult<CollectionMetadata> {
        let record = self
            .bkdb
            .collection_metadata(collection_name)?
            .ok_or_else(|| {
                SecretsError::InvalidCollection("nonexistent collection name given".into())
            })?;
        let metadata = CollectionMetadata::from_record(record)?;
        self.check_collection_access(caller_pid, &metadata)?;
        Ok(metadata)
    }

    fn check_collection_access(
        &self,
        caller_pid: u32,
        metadata: &CollectionMetadata,
    ) -> SecretsResult<()> {
        match metadata.access_control_mode {
            AccessControlMode::System => Err(SecretsError::OperationNotSupported(
                "access control requests are not currently supported".into(),
            )),
            AccessControlMode::OwnerOnly
                if metadata.application_id != self.caller_application_id(caller_pid) =>
            {
                Err(SecretsError::Permissions(format!(
                    "collection {} is owned by a different application",
                    metadata.collection_name
                )))
            }
            AccessControlMode::OwnerOnly => Ok(()),
        }
    }

    /// Inserts the pending entry, then dispatches the prompt. Insertion
    /// happens first so a fast completion always finds its continuation;
    /// a synchronous dispatch failure removes the entry again.
    pub(crate) fn dispatch_prompt(
        &self,
        plugin: Arc<dyn AuthenticationPlugin>,
        caller_pid: u32,
        request_id: u64,
        params: InteractionParameters,
        interaction_service_address: &str,
        continuation: Continuation,
    ) -> SecretsResult<Outcome> {
        self.pending.lock().insert(PendingRequest {
            caller_pid,
            request_id,
            continuation,
        });
        if let Err(err) = self.broker.begin_user_input(
            plugin,
            caller_pid,
            request_id,
            params,
            interaction_service_address.to_string(),
        ) {
            self.pending.lock().take(request_id);
            return Err(err);
        }
        Ok(Outcome::Pending)
    }

    /// Resolves the plugin for a user-input prompt (the requested plugin
    /// or the configured default).
    pub(crate) fn user_input_plugin(
        &self,
        requested: &str,
    ) -> SecretsResult<Arc<dyn AuthenticationPlugin>> {
        let plugin_name = self.broker.resolve_user_input_plugin(requested);
        self.registry.authentication(&plugin_name).ok_or_else(|| {
            SecretsError::InvalidExtensionPlugin(format!(
                "cannot get user input from invalid authentication plugin: {requested}"
            ))
        })
    }

    pub(crate) fn device_lock_key(&self) -> DerivedKey {
        self.lock_state.lock().device_lock_key().clone()
    }

    fn salt(&self) -> Vec<u8> {
        self.lock_state.lock().salt().to_vec()
    }

    /// Derives an encryption key from an authentication code using the
    /// strategy's key-derivation plugin, on the worker pool.
    pub(crate) async fn derive_key(
        &self,
        strategy: &Strategy,
        authentication_code: Vec<u8>,
    ) -> SecretsResult<DerivedKey> {
        let salt = self.salt();
        match strategy {
            Strategy::Encrypted(plugin) => {
                let plugin = Arc::clone(plugin);
                run_blocking(move || plugin.derive_key_from_code(&authentication_code, &salt))
                    .await
            }
            Strategy::Split { encryption, .. } => {
                let encryption = Arc::clone(encryption);
                run_blocking(move || encryption.derive_key_from_code(&authentication_code, &salt))
                    .await
            }
        }
    }

    /// Probes an encrypted-storage collection's lock state on the worker
    /// pool.
    pub(crate) async fn probe_collection_locked(
        &self,
        plugin: &Arc<dyn crate::plugin::EncryptedStoragePlugin>,
        collection_name: &str,
    ) -> SecretsResult<bool> {
        let plugin = Arc::clone(plugin);
        let name = collection_name.to_string();
        run_blocking(move || plugin.is_collection_locked(&name)).await
    }

    // Key cache and relock timers

    /// Caches a split-strategy collection key and arms its relock timer
    /// when the unlock semantic calls for one.
    pub(crate) fn cache_collection_key(&self, metadata: &CollectionMetadata, key: DerivedKey) {
        self.key_cache
            .lock()
            .insert_collection_key(&metadata.collection_name, key);
        self.arm_collection_relock_timer(
            &metadata.collection_name,
            metadata.unlock_semantic,
            metadata.custom_lock_timeout_ms,
        );
    }

    pub(crate) fn arm_collection_relock_timer(
        &self,
        collection_name: &str,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    ) {
        if unlock_semantic != UnlockSemantic::RelockAfterTimeout {
            return;
        }
        let mut cache = self.key_cache.lock();
        if !cache.contains_collection(collection_name)
            || cache.has_collection_timer(collection_name)
        {
            return;
        }
        let weak = self.weak.clone();
        let name = collection_name.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(custom_lock_timeout_ms)).await;
            if let Some(processor) = weak.upgrade() {
                debug!("relocking collection {name} after unlock timeout");
                processor.key_cache.lock().remove_collection(&name);
            }
        });
        cache.set_collection_timer(collection_name, timer);
    }

    pub(crate) fn cache_standalone_key(
        &self,
        hashed_secret_name: &str,
        key: DerivedKey,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    ) {
        self.key_cache
            .lock()
            .insert_standalone_key(hashed_secret_name, key);
        self.arm_standalone_relock_timer(hashed_secret_name, unlock_semantic, custom_lock_timeout_ms);
    }

    pub(crate) fn arm_standalone_relock_timer(
        &self,
        hashed_secret_name: &str,
        unlock_semantic: UnlockSemantic,
        custom_lock_timeout_ms: u64,
    ) {
        if unlock_semantic != UnlockSemantic::RelockAfterTimeout {
            return;
        }
        let mut cache = self.key_cache.lock();
        if !cache.contains_standalone(hashed_secret_name)
            || cache.has_standalone_timer(hashed_secret_name)
        {
            return;
        }
        let weak = self.weak.clone();
        let hashed = hashed_secret_name.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(custom_lock_timeout_ms)).await;
            if let Some(processor) = weak.upgrade() {
                debug!("relocking standalone secret {hashed} after unlock timeout");
                processor.key_cache.lock().remove_standalone(&hashed);
            }
        });
        cache.set_standalone_timer(hashed_secret_name, timer);
    }

    // Compensation

    fn insert_collection_row(&self, metadata: &CollectionMetadata) -> SecretsResult<()> {
        self.bkdb
            .insert_collection(&metadata.to_record())
            .map_err(|err| match err {
                DbError::AlreadyExists(name) => SecretsError::CollectionAlreadyExists(name),
                other => other.into(),
            })
    }

    /// One-shot compensation after a failed plugin create: delete the
    /// bookkeeping row; if that also fails, mark the row dirty and
    /// return the composite error.
    pub(crate) fn cleanup_delete_collection(
        &self,
        collection_name: &str,
        plugin_err: SecretsError,
    ) -> SecretsError {
        match self.bkdb.delete_collection(collection_name) {
            Ok(()) => plugin_err,
            Err(cleanup_err) => {
                self.mark_collection_dirty(collection_name);
                SecretsError::Database(format!(
                    "{plugin_err}; cleanup of the bookkeeping row also failed: {cleanup_err}"
                ))
            }
        }
    }

    /// One-shot compensation after a failed plugin store of a new
    /// secret.
    pub(crate) fn cleanup_delete_secret(
        &self,
        collection_name: &str,
        hashed_secret_name: &str,
        plugin_err: SecretsError,
    ) -> SecretsError {
        match self.bkdb.delete_secret(collection_name, hashed_secret_name) {
            Ok(()) => plugin_err,
            Err(cleanup_err) => {
                self.mark_secret_dirty(collection_name, hashed_secret_name);
                SecretsError::Database(format!(
                    "{plugin_err}; cleanup of the bookkeeping row also failed: {cleanup_err}"
                ))
            }
        }
    }

    pub(crate) fn mark_collection_dirty(&self, collection_name: &str) {
        self.dirty_collections
            .lock()
            .insert(collection_name.to_string());
    }

    pub(crate) fn mark_secret_dirty(&self, collection_name: &str, hashed_secret_name: &str) {
        self.dirty_secrets.lock().insert((
            collection_name.to_string(),
            hashed_secret_name.to_string(),
        ));
    }
}

/// Rejects reserved and empty collection names.
pub(crate) fn check_collection_name(collection_name: &str) -> SecretsResult<()> {
    if is_reserved_collection_name(collection_name) {
        return Err(SecretsError::InvalidCollection(
            "reserved collection name given".into(),
        ));
    }
    if collection_name.is_empty() {
        return Err(SecretsError::InvalidCollection(
            "empty collection name given".into(),
        ));
    }
    Ok(())
}

/// Rejects invalid identifiers for collection-secret operations.
pub(crate) fn check_collection_secret_identifier(
    identifier: &SecretIdentifier,
) -> SecretsResult<()> {
    if identifier.name.is_empty() {
        return Err(SecretsError::InvalidSecret("empty secret name given".into()));
    }
    check_collection_name(&identifier.collection_name)
}

/// Runs a blocking plugin or KDF call on the worker pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> SecretsResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> SecretsResult<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| SecretsError::unknown(format!("worker task failed: {e}")))?
}
