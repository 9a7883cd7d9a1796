//! Integration tests for collection create/delete flows: validation,
//! compensation on plugin failure, and interleave exclusion.

mod common;

use std::time::Duration;

use common::*;
use secretkit_core::{
    AccessControlMode, Outcome, Reply, Secret, SecretIdentifier, SecretsError, UnlockSemantic,
    UserInteractionMode,
};

async fn create_split_device_collection(daemon: &TestDaemon, name: &str) {
    let outcome = daemon
        .processor
        .create_device_lock_collection(
            CLIENT_PID,
            1,
            name,
            STORAGE,
            ENCRYPTION,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
        )
        .await
        .expect("create collection");
    assert_eq!(outcome, Outcome::Completed(Reply::Done));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_create_device_lock_collection_is_listed() {
    let daemon = test_daemon();
    create_split_device_collection(&daemon, "email").await;
    let names = daemon
        .processor
        .collection_names(CLIENT_PID)
        .await
        .expect("collection names");
    assert_eq!(names, vec!["email".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reserved_collection_name_rejected() {
    let daemon = test_daemon();
    for name in ["standalone", "Standalone", "STANDALONE"] {
        let err = daemon
            .processor
            .create_device_lock_collection(
                CLIENT_PID,
                1,
                name,
                ENCRYPTED_STORAGE,
                ENCRYPTED_STORAGE,
                UnlockSemantic::KeepUnlocked,
                AccessControlMode::OwnerOnly,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SecretsError::InvalidCollection(_)));
    }

    // the reserved name is rejected through the collection-secret API too
    let err = daemon
        .processor
        .get_collection_secret(
            CLIENT_PID,
            2,
            SecretIdentifier::new("s", "Standalone"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InvalidCollection(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_collection_rejected() {
    let daemon = test_daemon();
    create_split_device_collection(&daemon, "email").await;
    let err = daemon
        .processor
        .create_device_lock_collection(
            CLIENT_PID,
            2,
            "email",
            STORAGE,
            ENCRYPTION,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::CollectionAlreadyExists(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_plugins_rejected() {
    let daemon = test_daemon();
    // equal names must resolve to an encrypted-storage plugin
    let err = daemon
        .processor
        .create_device_lock_collection(
            CLIENT_PID,
            1,
            "c",
            STORAGE,
            STORAGE,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InvalidExtensionPlugin(_)));

    let err = daemon
        .processor
        .create_device_lock_collection(
            CLIENT_PID,
            2,
            "c",
            "missing",
            ENCRYPTION,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InvalidExtensionPlugin(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_create_plugin_failure_compensates_bookkeeping() {
    let daemon = test_daemon();
    daemon.storage.inject_create_collection_failure();
    let err = daemon
        .processor
        .create_device_lock_collection(
            CLIENT_PID,
            1,
            "c3",
            STORAGE,
            ENCRYPTION,
            UnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::Unknown(_)));

    // the bookkeeping row was compensated away: the name is free again
    let names = daemon.processor.collection_names(CLIENT_PID).await.unwrap();
    assert!(names.is_empty());
    create_split_device_collection(&daemon, "c3").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_collection_removes_metadata() {
    let daemon = test_daemon();
    create_split_device_collection(&daemon, "email").await;
    let outcome = daemon
        .processor
        .delete_collection(
            CLIENT_PID,
            2,
            "email",
            UserInteractionMode::SystemInteraction,
        )
        .await
        .expect("delete collection");
    assert_eq!(outcome, Outcome::Completed(Reply::Done));

    assert!(daemon
        .processor
        .collection_names(CLIENT_PID)
        .await
        .unwrap()
        .is_empty());
    let err = daemon
        .processor
        .get_collection_secret(
            CLIENT_PID,
            3,
            SecretIdentifier::new("s", "email"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InvalidCollection(_)));

    // deleting a nonexistent collection succeeds
    let outcome = daemon
        .processor
        .delete_collection(
            CLIENT_PID,
            4,
            "email",
            UserInteractionMode::SystemInteraction,
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed(Reply::Done));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_collection_owned_by_other_application() {
    let daemon = test_daemon();
    create_split_device_collection(&daemon, "email").await;
    let err = daemon
        .processor
        .delete_collection(
            OTHER_CLIENT_PID,
            2,
            "email",
            UserInteractionMode::SystemInteraction,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::Permissions(_)));

    let err = daemon
        .processor
        .get_collection_secret(
            OTHER_CLIENT_PID,
            3,
            SecretIdentifier::new("s", "email"),
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::Permissions(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interleaved_requests_get_transient_error() {
    let mut daemon = test_daemon();
    create_split_device_collection(&daemon, "c4").await;

    // hold the plugin's removal so the delete stays suspended
    let gate = daemon.storage.gate_removals();
    let processor = daemon.processor.clone();
    let delete_task = tokio::spawn(async move {
        processor
            .delete_collection(CLIENT_PID, 2, "c4", UserInteractionMode::SystemInteraction)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = daemon
        .processor
        .set_collection_secret(
            CLIENT_PID,
            3,
            Secret::new(SecretIdentifier::new("s", "c4"), b"abc".to_vec()),
            None,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InterleavedRequest(_)));
    assert!(err.is_transient());

    drop(gate);
    let outcome = delete_task.await.expect("join").expect("delete");
    assert_eq!(outcome, Outcome::Completed(Reply::Done));

    // after the delete wins, the set sees a missing collection
    let err = daemon
        .processor
        .set_collection_secret(
            CLIENT_PID,
            4,
            Secret::new(SecretIdentifier::new("s", "c4"), b"abc".to_vec()),
            None,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SecretsError::InvalidCollection(_)));

    // drain nothing: neither request went pending
    assert!(daemon.finished.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_custom_lock_collection_created_with_passphrase() {
    let mut daemon = test_daemon();
    daemon.auth.push_response(b"hunter2");
    let outcome = daemon
        .processor
        .create_custom_lock_collection(
            CLIENT_PID,
            7,
            "wallet",
            STORAGE,
            ENCRYPTION,
            AUTH,
            UnlockSemantic::KeepUnlocked,
            0,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .expect("create custom lock collection");
    assert_eq!(outcome, Outcome::Pending);
    assert_eq!(finished(&mut daemon, 7).await.expect("created"), Reply::Done);

    let names = daemon.processor.collection_names(CLIENT_PID).await.unwrap();
    assert_eq!(names, vec!["wallet".to_string()]);
    let prompts = daemon.auth.recorded_prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].prompt_text.contains("wallet"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_custom_lock_collection_create_cancelled() {
    let mut daemon = test_daemon();
    daemon.auth.push_cancel();
    let outcome = daemon
        .processor
        .create_custom_lock_collection(
            CLIENT_PID,
            8,
            "wallet",
            STORAGE,
            ENCRYPTION,
            AUTH,
            UnlockSemantic::KeepUnlocked,
            0,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    let err = finished(&mut daemon, 8).await.unwrap_err();
    assert!(matches!(err, SecretsError::InteractionViewUserCanceled(_)));

    // nothing was created
    assert!(daemon
        .processor
        .collection_names(CLIENT_PID)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prevent_interaction_rejects_custom_lock_create() {
    let daemon = test_daemon();
    let err = daemon
        .processor
        .create_custom_lock_collection(
            CLIENT_PID,
            9,
            "wallet",
            STORAGE,
            ENCRYPTION,
            AUTH,
            UnlockSemantic::KeepUnlocked,
            0,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::PreventInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SecretsError::OperationRequiresUserInteraction(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_application_specific_auth_requires_service_address() {
    let mut daemon = test_daemon();
    let err = daemon
        .processor
        .create_custom_lock_collection(
            CLIENT_PID,
            10,
            "wallet",
            STORAGE,
            ENCRYPTION,
            APP_AUTH,
            UnlockSemantic::KeepUnlocked,
            0,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::SystemInteraction,
            "",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SecretsError::OperationRequiresApplicationUserInteraction(_)
    ));

    // with the right mode and a service address the flow proceeds
    daemon.app_auth.push_response(b"hunter2");
    let outcome = daemon
        .processor
        .create_custom_lock_collection(
            CLIENT_PID,
            11,
            "wallet",
            STORAGE,
            ENCRYPTION,
            APP_AUTH,
            UnlockSemantic::KeepUnlocked,
            0,
            AccessControlMode::OwnerOnly,
            UserInteractionMode::ApplicationInteraction,
            "org.example.interaction",
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Pending);
    assert_eq!(finished(&mut daemon, 11).await.expect("created"), Reply::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_plugin_info_reports_all_kinds() {
    let daemon = test_daemon();
    let report = daemon.processor.get_plugin_info(CLIENT_PID).await.unwrap();
    let storage_names: Vec<_> = report
        .storage_plugins
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    assert!(storage_names.contains(&STORAGE));
    assert!(storage_names.contains(&OTHER_STORAGE));
    assert_eq!(report.encryption_plugins.len(), 1);
    assert_eq!(report.encrypted_storage_plugins.len(), 1);
    assert_eq!(report.authentication_plugins.len(), 3);
}
