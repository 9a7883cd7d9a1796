//! Integration tests for the lock-code controller: database re-key,
//! provide/forget cycles, and plugin-targeted lock operations.

mod common;

use common::*;
use secretkit_core::{
    AccessControlMode, LockCodeTarget, Outcome, Reply, Secret, SecretIdentifier, SecretsError,
    UnlockSemantic, UserInteractionMode,
};

async fn modify_database_lock(
    daemon: &mut TestDaemon,
    request_id: u64,
    old_code: &[u8],
    new_code: &[u8],
) -> secretkit_core::SecretsResult<Reply> {
    daemon.default_auth.push_response(old_code);
    daemon.default_auth.push_response(new_code);
    let outcome = daemon
        .processor
        .modify_lock_code(
            PLATFORM_PID,
            request_id,
            LockCodeTarget::BookkeepingDatabase,
            "",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await?;
    assert_eq!(outcome, Outcome::Pending);
    finished(daemon, request_id).await
}

async fn provide_database_lock(
    daemon: &mut TestDaemon,
    request_id: u64,
    code: &[u8],
) -> secretkit_core::SecretsResult<Reply> {
    daemon.default_auth.push_response(code);
    let outcome = daemon
        .processor
        .provide_lock_code(
            PLATFORM_PID,
            request_id,
            LockCodeTarget::BookkeepingDatabase,
            "",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await?;
    assert_eq!(outcome, Outcome::Pending);
    finished(daemon, request_id).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_modify_database_lock_requires_platform_application() {
    let daemon = test_daemon();
    let err = daemon
        .processor
        .modify_lock_code(
            CLIENT_PID,
            1,
            LockCodeTarget::BookkeepingDatabase,
            "",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::Permissions(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_modify_database_lock_rejects_target_name() {
    let daemon = test_daemon();
    let err = daemon
        .processor
        .modify_lock_code(
            PLATFORM_PID,
            1,
            LockCodeTarget::BookkeepingDatabase,
            "some-target",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::OperationNotSupported(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_secret_and_collection_lock_targets_unsupported() {
    let daemon = test_daemon();
    for target in [LockCodeTarget::StandaloneSecret, LockCodeTarget::Collection] {
        let err = daemon
            .processor
            .modify_lock_code(
                PLATFORM_PID,
                1,
                target,
                "x",
                lock_code_params(),
                UserInteractionMode::SystemInteraction,
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SecretsError::OperationNotSupported(_)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_modify_database_lock_with_wrong_old_code() {
    let mut daemon = test_daemon();
    let err = modify_database_lock(&mut daemon, 2, b"wrong", b"new").await.unwrap_err();
    assert!(matches!(err, SecretsError::SecretsDaemonLocked(_)));

    // the daemon stays usable under the original (empty) code
    assert!(daemon.processor.collection_names(CLIENT_PID).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rekey_keeps_device_locked_collections_readable() {
    let mut daemon = test_daemon();

    // a device-locked split collection with one secret, stored under the
    // boot (empty) lock code
    let outcome = daemon
        .processor
        .create_device_lock_collection(
            CLIENT_PID,
            1,
            "c",
            STORAGE,
            ENCRYPTION,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));
    daemon
        .processor
        .set_collection_secret(
            CLIENT_PID,
            2,
            Secret::new(SecretIdentifier::new("s", "c"), b"abc".to_vec()),
            None,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .expect("set secret");

    // re-key from the empty boot code to "new"
    assert_eq!(
        modify_database_lock(&mut daemon, 3, b"", b"new").await.expect("re-key"),
        Reply::Done
    );

    // the collection's payload was re-encrypted and stays readable
    let outcome = daemon
        .processor
        .get_collection_secret(
            CLIENT_PID,
            4,
            SecretIdentifier::new("s", "c"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .expect("get secret after re-key");
    match outcome {
        Outcome::Completed(Reply::Secret(secret)) => assert_eq!(secret.data, b"abc"),
        other => panic!("expected secret, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rekey_keeps_standalone_device_lock_secrets_readable() {
    let mut daemon = test_daemon();
    daemon
        .processor
        .set_standalone_device_lock_secret(
            CLIENT_PID,
            1,
            STORAGE,
            ENCRYPTION,
            Secret::new(SecretIdentifier::standalone("wifi"), b"psk".to_vec()),
            None,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .expect("set standalone secret");

    assert_eq!(
        modify_database_lock(&mut daemon, 2, b"", b"new").await.expect("re-key"),
        Reply::Done
    );

    let outcome = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            3,
            SecretIdentifier::standalone("wifi"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .expect("get standalone secret after re-key");
    match outcome {
        Outcome::Completed(Reply::Secret(secret)) => assert_eq!(secret.data, b"psk"),
        other => panic!("expected secret, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forget_then_provide_with_null_code() {
    let mut daemon = test_daemon();
    let outcome = daemon
        .processor
        .forget_lock_code(
            PLATFORM_PID,
            1,
            LockCodeTarget::BookkeepingDatabase,
            "",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));

    // the daemon is locked; metadata operations fail
    let err = daemon.processor.collection_names(CLIENT_PID).await.unwrap_err();
    assert!(matches!(err, SecretsError::SecretsDaemonLocked(_)));

    // opened without a code at boot, so provide unlocks without a prompt
    let outcome = daemon
        .processor
        .provide_lock_code(
            PLATFORM_PID,
            2,
            LockCodeTarget::BookkeepingDatabase,
            "",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));
    assert!(daemon.processor.collection_names(CLIENT_PID).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_old_code_is_dead_after_rekey_forget_provide() {
    let mut daemon = test_daemon();
    assert_eq!(
        modify_database_lock(&mut daemon, 1, b"", b"new").await.expect("re-key"),
        Reply::Done
    );

    let outcome = daemon
        .processor
        .forget_lock_code(
            PLATFORM_PID,
            2,
            LockCodeTarget::BookkeepingDatabase,
            "",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));

    // the old (empty) code no longer unlocks
    let err = provide_database_lock(&mut daemon, 3, b"").await.unwrap_err();
    assert!(matches!(err, SecretsError::SecretsDaemonLocked(_)));

    // the new code does
    assert_eq!(
        provide_database_lock(&mut daemon, 4, b"new").await.expect("unlock"),
        Reply::Done
    );
    assert!(daemon.processor.collection_names(CLIENT_PID).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_provide_fails_when_database_not_locked() {
    let daemon = test_daemon();
    let err = daemon
        .processor
        .provide_lock_code(
            PLATFORM_PID,
            1,
            LockCodeTarget::BookkeepingDatabase,
            "",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::Unknown(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_lock_code_cycle() {
    let mut daemon = test_daemon();

    // re-key the lockable plugin from its initial empty code
    daemon.default_auth.push_response(b"");
    daemon.default_auth.push_response(b"pcode");
    let outcome = daemon
        .processor
        .modify_lock_code(
            PLATFORM_PID,
            1,
            LockCodeTarget::ExtensionPlugin,
            LOCKABLE_STORAGE,
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    assert_eq!(finished(&mut daemon, 1).await.expect("re-key"), Reply::Done);

    // lock it, then unlock with the wrong and right codes
    let outcome = daemon
        .processor
        .forget_lock_code(
            PLATFORM_PID,
            2,
            LockCodeTarget::ExtensionPlugin,
            LOCKABLE_STORAGE,
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));

    daemon.default_auth.push_response(b"wrong");
    let outcome = daemon
        .processor
        .provide_lock_code(
            PLATFORM_PID,
            3,
            LockCodeTarget::ExtensionPlugin,
            LOCKABLE_STORAGE,
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    let err = finished(&mut daemon, 3).await.unwrap_err();
    assert!(matches!(err, SecretsError::Unknown(_)));

    daemon.default_auth.push_response(b"pcode");
    let outcome = daemon
        .processor
        .provide_lock_code(
            PLATFORM_PID,
            4,
            LockCodeTarget::ExtensionPlugin,
            LOCKABLE_STORAGE,
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    assert_eq!(finished(&mut daemon, 4).await.expect("unlock"), Reply::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_without_locking_support_refuses() {
    let mut daemon = test_daemon();
    daemon.default_auth.push_response(b"");
    daemon.default_auth.push_response(b"x");
    let outcome = daemon
        .processor
        .modify_lock_code(
            PLATFORM_PID,
            1,
            LockCodeTarget::ExtensionPlugin,
            STORAGE,
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    let err = finished(&mut daemon, 1).await.unwrap_err();
    assert!(matches!(err, SecretsError::OperationNotSupported(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_plugin_lock_target() {
    let mut daemon = test_daemon();
    daemon.default_auth.push_response(b"");
    daemon.default_auth.push_response(b"x");
    let outcome = daemon
        .processor
        .modify_lock_code(
            PLATFORM_PID,
            1,
            LockCodeTarget::ExtensionPlugin,
            "no-such-plugin",
            lock_code_params(),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    let err = finished(&mut daemon, 1).await.unwrap_err();
    assert!(matches!(err, SecretsError::InvalidExtensionPlugin(_)));
}
