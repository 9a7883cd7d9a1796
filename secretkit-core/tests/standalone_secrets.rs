//! Integration tests for standalone secrets: device-lock and custom-lock
//! round trips, lock-kind and storage-plugin immutability.

mod common;

use std::time::Duration;

use common::*;
use secretkit_core::{
    AccessControlMode, Outcome, Reply, Secret, SecretIdentifier, SecretsError, UnlockSemantic,
    UserInteractionMode,
};

fn standalone_secret(name: &str, data: &[u8]) -> Secret {
    Secret::new(SecretIdentifier::standalone(name), data.to_vec())
}

fn expect_secret(reply: Reply) -> Secret {
    match reply {
        Reply::Secret(secret) => secret,
        other => panic!("expected a secret reply, got {other:?}"),
    }
}

async fn set_device_lock(
    daemon: &TestDaemon,
    request_id: u64,
    storage_plugin: &str,
    name: &str,
    data: &[u8],
) -> secretkit_core::SecretsResult<Outcome> {
    daemon
        .processor
        .set_standalone_device_lock_secret(
            CLIENT_PID,
            request_id,
            storage_plugin,
            ENCRYPTION,
            standalone_secret(name, data),
            None,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standalone_device_lock_round_trip() {
    let daemon = test_daemon();
    let outcome = set_device_lock(&daemon, 1, STORAGE, "wifi", b"psk").await.unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));

    let outcome = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            2,
            SecretIdentifier::standalone("wifi"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .expect("get standalone secret");
    let restored = match outcome {
        Outcome::Completed(reply) => expect_secret(reply),
        Outcome::Pending => panic!("cached read should not suspend"),
    };
    assert_eq!(restored.data, b"psk");
    assert!(restored.identifier.collection_name.is_empty());

    let outcome = daemon
        .processor
        .delete_standalone_secret(
            CLIENT_PID,
            3,
            SecretIdentifier::standalone("wifi"),
            UserInteractionMode::SystemInteraction,
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));

    let err = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            4,
            SecretIdentifier::standalone("wifi"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InvalidSecret(_)));

    // deleting again still succeeds
    let outcome = daemon
        .processor
        .delete_standalone_secret(
            CLIENT_PID,
            5,
            SecretIdentifier::standalone("wifi"),
            UserInteractionMode::SystemInteraction,
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standalone_lock_kind_is_immutable() {
    let mut daemon = test_daemon();
    set_device_lock(&daemon, 1, STORAGE, "vpn", b"key").await.unwrap();

    // device-lock -> custom-lock is refused
    let err = daemon
        .processor
        .set_standalone_custom_lock_secret(
            CLIENT_PID,
            2,
            STORAGE,
            ENCRYPTION,
            AUTH,
            standalone_secret("vpn", b"other"),
            None,
            UnlockSemantic::KeepUnlocked,
            0,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::OperationNotSupported(_)));

    // custom-lock -> device-lock is refused too
    daemon.auth.push_response(b"pp");
    let outcome = daemon
        .processor
        .set_standalone_custom_lock_secret(
            CLIENT_PID,
            3,
            STORAGE,
            ENCRYPTION,
            AUTH,
            standalone_secret("mail", b"pw"),
            None,
            UnlockSemantic::KeepUnlocked,
            0,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    finished(&mut daemon, 3).await.expect("stored");

    let err = set_device_lock(&daemon, 4, STORAGE, "mail", b"pw").await.unwrap_err();
    assert!(matches!(err, SecretsError::OperationNotSupported(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standalone_storage_plugin_is_immutable() {
    let daemon = test_daemon();
    set_device_lock(&daemon, 1, STORAGE, "vpn", b"key").await.unwrap();
    let err = set_device_lock(&daemon, 2, OTHER_STORAGE, "vpn", b"key").await.unwrap_err();
    assert!(matches!(err, SecretsError::OperationNotSupported(_)));

    // overwriting through the same plugin is fine
    let outcome = set_device_lock(&daemon, 3, STORAGE, "vpn", b"new-key").await.unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standalone_custom_lock_relock_and_reauthenticate() {
    let mut daemon = test_daemon();

    daemon.auth.push_response(b"pp");
    let outcome = daemon
        .processor
        .set_standalone_custom_lock_secret(
            CLIENT_PID,
            1,
            STORAGE,
            ENCRYPTION,
            AUTH,
            standalone_secret("token", b"t0k"),
            None,
            UnlockSemantic::RelockAfterTimeout,
            400,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    finished(&mut daemon, 1).await.expect("stored");

    // still unlocked: reads straight from the cache
    let outcome = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            2,
            SecretIdentifier::standalone("token"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    let restored = match outcome {
        Outcome::Completed(reply) => expect_secret(reply),
        Outcome::Pending => panic!("cached read should not suspend"),
    };
    assert_eq!(restored.data, b"t0k");

    tokio::time::sleep(Duration::from_millis(900)).await;

    let err = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            3,
            SecretIdentifier::standalone("token"),
            UserInteractionMode::PreventInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SecretsError::OperationRequiresUserInteraction(_)
    ));

    daemon.auth.push_response(b"pp");
    let outcome = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            4,
            SecretIdentifier::standalone("token"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    let restored = expect_secret(finished(&mut daemon, 4).await.expect("get secret"));
    assert_eq!(restored.data, b"t0k");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standalone_device_lock_in_encrypted_storage_stays_locked() {
    let daemon = test_daemon();
    let outcome = daemon
        .processor
        .set_standalone_device_lock_secret(
            CLIENT_PID,
            1,
            ENCRYPTED_STORAGE,
            ENCRYPTED_STORAGE,
            standalone_secret("hw", b"blob"),
            None,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));

    // no derived key is cached for encrypted-storage secrets; reading
    // demands device lock authentication
    let err = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            2,
            SecretIdentifier::standalone("hw"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::CollectionIsLocked(_)));

    // deletion verifies the device lock key inside the plugin
    let outcome = daemon
        .processor
        .delete_standalone_secret(
            CLIENT_PID,
            3,
            SecretIdentifier::standalone("hw"),
            UserInteractionMode::SystemInteraction,
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standalone_identifier_validation() {
    let daemon = test_daemon();
    let err = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            1,
            SecretIdentifier::new("s", "not-standalone"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InvalidCollection(_)));

    let err = daemon
        .processor
        .get_standalone_secret(
            CLIENT_PID,
            2,
            SecretIdentifier::standalone(""),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InvalidSecret(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standalone_secret_owned_by_other_application() {
    let daemon = test_daemon();
    set_device_lock(&daemon, 1, STORAGE, "vpn", b"key").await.unwrap();
    let err = daemon
        .processor
        .get_standalone_secret(
            OTHER_CLIENT_PID,
            2,
            SecretIdentifier::standalone("vpn"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::Permissions(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_find_standalone_secrets_not_supported() {
    let daemon = test_daemon();
    let err = daemon
        .processor
        .find_standalone_secrets(
            CLIENT_PID,
            1,
            secretkit_core::FilterData::new(),
            secretkit_core::FilterOperator::AllOf,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::OperationNotSupported(_)));
}
