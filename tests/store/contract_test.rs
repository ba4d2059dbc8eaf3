//! The persistence contract, run against every backend: the in-process map,
//! an in-memory SQLite database, and a file-backed one.

use std::sync::Arc;

use tempfile::TempDir;

use simstim::credential::Credential;
use simstim::platforms::PlatformId;
use simstim::schema::TokenUsage;
use simstim::store::{CredentialStore, MemoryStore, NewUsage, SqliteStore, StoreError};

/// Every backend the contract must hold for. The temp dir guard keeps the
/// file-backed database alive for the duration of a test.
async fn backends() -> Vec<(&'static str, Arc<dyn CredentialStore>, Option<TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let file_store = SqliteStore::connect(&dir.path().join("contract.db"))
        .await
        .unwrap();
    vec![
        (
            "memory",
            Arc::new(MemoryStore::new()) as Arc<dyn CredentialStore>,
            None,
        ),
        (
            "sqlite-memory",
            Arc::new(SqliteStore::connect_in_memory().await.unwrap()) as Arc<dyn CredentialStore>,
            None,
        ),
        (
            "sqlite-file",
            Arc::new(file_store) as Arc<dyn CredentialStore>,
            Some(dir),
        ),
    ]
}

fn credential(owner: &str, platform: PlatformId, quota_limit: u64) -> Credential {
    Credential::fresh(owner, platform, format!("blob-{owner}"), quota_limit)
}

#[tokio::test]
async fn a_credential_round_trips_and_upsert_replaces() {
    for (backend, store, _guard) in backends().await {
        assert!(
            store.get("ann", PlatformId::Doubao).await.unwrap().is_none(),
            "{backend}: store should start empty"
        );

        let original = credential("ann", PlatformId::Doubao, 1_000);
        store.upsert(&original).await.unwrap();
        let read = store
            .get("ann", PlatformId::Doubao)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.owner_id, "ann", "{backend}");
        assert_eq!(read.platform, PlatformId::Doubao, "{backend}");
        assert_eq!(read.cipher_blob, original.cipher_blob, "{backend}");
        assert_eq!(read.quota_limit, 1_000, "{backend}");
        assert!(read.is_usable(), "{backend}");

        // A second upsert replaces the row wholesale.
        let mut replacement = credential("ann", PlatformId::Doubao, 5_000);
        replacement.cipher_blob = "blob-rotated".to_owned();
        store.upsert(&replacement).await.unwrap();
        let read = store
            .get("ann", PlatformId::Doubao)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.cipher_blob, "blob-rotated", "{backend}");
        assert_eq!(read.quota_limit, 5_000, "{backend}");
        assert_eq!(read.quota_used, 0, "{backend}");

        assert!(store.delete("ann", PlatformId::Doubao).await.unwrap());
        assert!(
            store.get("ann", PlatformId::Doubao).await.unwrap().is_none(),
            "{backend}: deleted credential must be gone"
        );
        assert!(
            !store.delete("ann", PlatformId::Doubao).await.unwrap(),
            "{backend}: deleting twice reports nothing removed"
        );
    }
}

#[tokio::test]
async fn usage_accumulates_atomically_under_concurrency() {
    for (backend, store, _guard) in backends().await {
        store
            .upsert(&credential("ann", PlatformId::ChatQwen, 10_000))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.add_usage("ann", PlatformId::ChatQwen, 5).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let read = store
            .get("ann", PlatformId::ChatQwen)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.quota_used, 80, "{backend}: increments must not be lost");
        assert!(read.last_used_at.is_some(), "{backend}");
    }
}

#[tokio::test]
async fn exhaustion_is_reported_exactly_at_the_limit() {
    for (backend, store, _guard) in backends().await {
        store
            .upsert(&credential("ann", PlatformId::Doubao, 100))
            .await
            .unwrap();

        let snapshot = store.add_usage("ann", PlatformId::Doubao, 60).await.unwrap();
        assert_eq!(snapshot.quota_used, 60, "{backend}");
        assert!(!snapshot.exhausted(), "{backend}");

        let snapshot = store.add_usage("ann", PlatformId::Doubao, 40).await.unwrap();
        assert_eq!(snapshot.quota_used, 100, "{backend}");
        assert!(snapshot.exhausted(), "{backend}: reaching the limit exhausts");

        let read = store
            .get("ann", PlatformId::Doubao)
            .await
            .unwrap()
            .unwrap();
        assert!(read.quota_exhausted(), "{backend}");
    }
}

#[tokio::test]
async fn usage_against_a_missing_credential_is_an_error() {
    for (backend, store, _guard) in backends().await {
        let err = store
            .add_usage("nobody", PlatformId::Doubao, 1)
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::MissingCredential { .. }),
            "{backend}: got {err:?}"
        );
    }
}

#[tokio::test]
async fn validation_probes_stamp_the_credential_both_ways() {
    for (backend, store, _guard) in backends().await {
        store
            .upsert(&credential("ann", PlatformId::ChatQwen, 1_000))
            .await
            .unwrap();

        store
            .mark_validated("ann", PlatformId::ChatQwen, false)
            .await
            .unwrap();
        let read = store
            .get("ann", PlatformId::ChatQwen)
            .await
            .unwrap()
            .unwrap();
        assert!(read.is_expired, "{backend}");
        assert!(read.last_validated_at.is_some(), "{backend}");

        // A later successful probe brings it back.
        store
            .mark_validated("ann", PlatformId::ChatQwen, true)
            .await
            .unwrap();
        let read = store
            .get("ann", PlatformId::ChatQwen)
            .await
            .unwrap()
            .unwrap();
        assert!(!read.is_expired, "{backend}");

        store.mark_expired("ann", PlatformId::ChatQwen).await.unwrap();
        let read = store
            .get("ann", PlatformId::ChatQwen)
            .await
            .unwrap()
            .unwrap();
        assert!(read.is_expired, "{backend}");
    }
}

#[tokio::test]
async fn the_usage_log_is_newest_first_filtered_and_capped() {
    for (backend, store, _guard) in backends().await {
        let rows = [
            ("ann", PlatformId::Doubao, "model-a", "ok"),
            ("ann", PlatformId::ChatQwen, "model-b", "error"),
            ("ann", PlatformId::Doubao, "model-c", "expired"),
            ("bob", PlatformId::Doubao, "model-d", "ok"),
        ];
        for (owner, platform, model, outcome) in rows {
            store
                .append_usage(NewUsage {
                    owner_id: owner,
                    platform,
                    model,
                    usage: TokenUsage {
                        prompt_tokens: 3,
                        completion_tokens: 4,
                    },
                    latency_ms: 250,
                    outcome,
                    error: (outcome != "ok").then_some("detail"),
                })
                .await
                .unwrap();
        }

        let log = store.recent_usage("ann", None, 10).await.unwrap();
        assert_eq!(log.len(), 3, "{backend}");
        assert_eq!(
            log.iter().map(|r| r.model.as_str()).collect::<Vec<_>>(),
            ["model-c", "model-b", "model-a"],
            "{backend}: newest first"
        );
        assert_eq!(log[0].outcome, "expired", "{backend}");
        assert_eq!(log[0].usage.total(), 7, "{backend}");
        assert_eq!(log[0].latency_ms, 250, "{backend}");
        assert_eq!(log[0].error.as_deref(), Some("detail"), "{backend}");
        assert_eq!(log[2].error, None, "{backend}");

        let doubao_only = store
            .recent_usage("ann", Some(PlatformId::Doubao), 10)
            .await
            .unwrap();
        assert_eq!(doubao_only.len(), 2, "{backend}");
        assert!(
            doubao_only.iter().all(|r| r.platform == PlatformId::Doubao),
            "{backend}"
        );

        let capped = store.recent_usage("ann", None, 2).await.unwrap();
        assert_eq!(capped.len(), 2, "{backend}");
        assert_eq!(capped[0].model, "model-c", "{backend}");

        let bobs = store.recent_usage("bob", None, 10).await.unwrap();
        assert_eq!(bobs.len(), 1, "{backend}");
    }
}
