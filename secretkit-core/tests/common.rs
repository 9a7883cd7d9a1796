#![allow(dead_code)] // not every test binary uses every helper

//! Common test harness shared across integration tests.
//!
//! Builds a processor over an in-memory bookkeeping database and the
//! in-memory plugin set: one storage plugin ("teststorage", plus a
//! second one for plugin-immutability checks), one encryption plugin
//! ("testencryption"), one encrypted-storage plugin
//! ("testencryptedstorage"), a collection authentication plugin
//! ("testauth") and the autotest default authentication plugin.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use secretkit_core::plugin::memory::{
    MemoryAuthenticationPlugin, MemoryEncryptedStoragePlugin, MemoryEncryptionPlugin,
    MemoryStoragePlugin,
};
use secretkit_core::plugin::PluginRegistry;
use secretkit_core::{
    EchoMode, InputType, InteractionOperation, InteractionParameters, Reply, RequestFinished,
    RequestProcessor, SecretsResult, StaticApplicationPermissions, AUTOTEST_PLUGIN_SUFFIX,
    DEFAULT_AUTHENTICATION_PLUGIN,
};
use secretkit_db::BookkeepingDb;

pub const CLIENT_PID: u32 = 42;
pub const OTHER_CLIENT_PID: u32 = 43;
pub const PLATFORM_PID: u32 = 1;

pub const STORAGE: &str = "teststorage";
pub const OTHER_STORAGE: &str = "teststorage2";
pub const LOCKABLE_STORAGE: &str = "lockablestorage";
pub const ENCRYPTION: &str = "testencryption";
pub const ENCRYPTED_STORAGE: &str = "testencryptedstorage";
pub const AUTH: &str = "testauth";
pub const APP_AUTH: &str = "testappauth";

pub struct TestDaemon {
    pub processor: Arc<RequestProcessor>,
    pub finished: mpsc::UnboundedReceiver<RequestFinished>,
    pub storage: Arc<MemoryStoragePlugin>,
    pub other_storage: Arc<MemoryStoragePlugin>,
    pub lockable_storage: Arc<MemoryStoragePlugin>,
    pub encryption: Arc<MemoryEncryptionPlugin>,
    pub encrypted_storage: Arc<MemoryEncryptedStoragePlugin>,
    pub auth: Arc<MemoryAuthenticationPlugin>,
    pub app_auth: Arc<MemoryAuthenticationPlugin>,
    pub default_auth: Arc<MemoryAuthenticationPlugin>,
}

pub fn test_daemon() -> TestDaemon {
    let bkdb = Arc::new(BookkeepingDb::open_in_memory().expect("open bookkeeping db"));

    let storage = Arc::new(MemoryStoragePlugin::new(STORAGE));
    let other_storage = Arc::new(MemoryStoragePlugin::new(OTHER_STORAGE));
    let lockable_storage = Arc::new(MemoryStoragePlugin::with_locking(LOCKABLE_STORAGE));
    let encryption = Arc::new(MemoryEncryptionPlugin::new(ENCRYPTION));
    let encrypted_storage = Arc::new(MemoryEncryptedStoragePlugin::new(ENCRYPTED_STORAGE));
    let auth = Arc::new(MemoryAuthenticationPlugin::new(AUTH));
    let app_auth = Arc::new(MemoryAuthenticationPlugin::application_specific(APP_AUTH));
    let default_auth = Arc::new(MemoryAuthenticationPlugin::new(format!(
        "{DEFAULT_AUTHENTICATION_PLUGIN}{AUTOTEST_PLUGIN_SUFFIX}"
    )));

    let mut registry = PluginRegistry::new();
    registry.register_storage(storage.clone());
    registry.register_storage(other_storage.clone());
    registry.register_storage(lockable_storage.clone());
    registry.register_encryption(encryption.clone());
    registry.register_encrypted_storage(encrypted_storage.clone());
    registry.register_authentication(auth.clone());
    registry.register_authentication(app_auth.clone());
    registry.register_authentication(default_auth.clone());

    let permissions = Arc::new(StaticApplicationPermissions::new());
    permissions.add_platform_pid(PLATFORM_PID);

    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let processor = RequestProcessor::new(bkdb, registry, permissions, true, finished_tx)
        .expect("create processor");

    TestDaemon {
        processor,
        finished: finished_rx,
        storage,
        other_storage,
        lockable_storage,
        encryption,
        encrypted_storage,
        auth,
        app_auth,
        default_auth,
    }
}

/// Awaits the terminal result of a request that went `Pending`.
pub async fn finished(daemon: &mut TestDaemon, request_id: u64) -> SecretsResult<Reply> {
    let notification = tokio::time::timeout(Duration::from_secs(10), daemon.finished.recv())
        .await
        .expect("timed out waiting for request completion")
        .expect("finished channel closed");
    assert_eq!(notification.request_id, request_id);
    notification.result
}

/// Interaction parameters asking the daemon to prompt for secret data.
pub fn user_data_params() -> InteractionParameters {
    InteractionParameters {
        application_id: String::new(),
        collection_name: String::new(),
        secret_name: String::new(),
        authentication_plugin_name: String::new(),
        operation: InteractionOperation::RequestUserData,
        input_type: InputType::AlphaNumeric,
        echo_mode: EchoMode::Normal,
        prompt_text: "enter the secret data".to_string(),
    }
}

/// Interaction parameters for lock-code prompts through the default
/// authentication plugin.
pub fn lock_code_params() -> InteractionParameters {
    InteractionParameters::passphrase(
        InteractionOperation::ModifyLockDatabase,
        "lock code".to_string(),
    )
}
