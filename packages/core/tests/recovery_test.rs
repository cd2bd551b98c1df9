//! Snapshot and recovery fidelity
//!
//! Tests cover:
//! - P2: snapshot + log replay reconstructs state exactly
//! - snapshot/load identity on the tabular projection
//! - Version monotonicity across restarts (P1)
//! - Log pruning never breaks recovery
//! - Degraded read-only mode after a poisoned log

use edgewarden_core::config::CoreConfig;
use edgewarden_core::db::{MemoryMutationLog, MemoryObjectStore, MutationLog, ObjectStore};
use edgewarden_core::models::edge::Capability;
use edgewarden_core::models::mutation::{MutationRequest, RevokeTarget, Version};
use edgewarden_core::tenant::TenantHandle;
use std::sync::Arc;

struct TestEnv {
    object_store: Arc<dyn ObjectStore>,
    log: Arc<dyn MutationLog>,
    config: Arc<CoreConfig>,
}

impl TestEnv {
    fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    fn with_config(config: CoreConfig) -> Self {
        Self {
            object_store: Arc::new(MemoryObjectStore::new()),
            log: Arc::new(MemoryMutationLog::new()),
            config: Arc::new(config),
        }
    }

    async fn open(&self) -> Arc<TenantHandle> {
        TenantHandle::open(
            "acme",
            self.object_store.clone(),
            self.log.clone(),
            self.config.clone(),
        )
        .await
        .unwrap()
    }
}

fn upsert(entity: &str, id: &str) -> MutationRequest {
    MutationRequest::UpsertEntity {
        entity: entity.to_string(),
        row: serde_json::json!({ "id": id }).as_object().unwrap().clone(),
    }
}

fn grant_read(source: &str, target: &str) -> MutationRequest {
    MutationRequest::Grant {
        relation: "has_permission".to_string(),
        source: source.to_string(),
        target: target.to_string(),
        properties: Some(
            serde_json::json!({ "capability": "read" })
                .as_object()
                .unwrap()
                .clone(),
        ),
    }
}

/// Drive a representative mutation history: entities, grants, a revocation
async fn drive_history(handle: &TenantHandle) {
    for (entity, id) in [
        ("user", "user:alice"),
        ("user", "user:bob"),
        ("group", "group:eng"),
        ("resource", "resource:doc1"),
        ("resource", "resource:doc2"),
    ] {
        handle.apply(&upsert(entity, id), None).await.unwrap();
    }
    handle
        .apply(&grant_read("user:alice", "resource:doc1"), None)
        .await
        .unwrap();
    let revoked = handle
        .apply(&grant_read("user:bob", "resource:doc1"), None)
        .await
        .unwrap();
    handle
        .apply(
            &MutationRequest::Grant {
                relation: "member_of".to_string(),
                source: "user:alice".to_string(),
                target: "group:eng".to_string(),
                properties: None,
            },
            None,
        )
        .await
        .unwrap();
    handle
        .apply(
            &MutationRequest::Revoke {
                target: RevokeTarget::ById {
                    edge_id: revoked.edge_id.unwrap(),
                },
            },
            None,
        )
        .await
        .unwrap();
}

/// Snapshot-comparable projection of a tenant's state
async fn fingerprint(handle: &TenantHandle) -> (Version, serde_json::Value) {
    handle
        .with_state(|state| {
            let data = state.snapshot_data().unwrap();
            let tables: serde_json::Value = data
                .tables
                .iter()
                .map(|(name, rows)| (name.clone(), serde_json::json!(rows)))
                .collect::<serde_json::Map<_, _>>()
                .into();
            (data.version, tables)
        })
        .await
}

// =========================================================================
// P2: recovery fidelity
// =========================================================================

#[tokio::test]
async fn test_snapshot_plus_log_replay_reconstructs_state() {
    let env = TestEnv::new();
    let handle = env.open().await;

    // Snapshot at version V mid-history
    for (entity, id) in [("user", "user:alice"), ("resource", "resource:doc1")] {
        handle.apply(&upsert(entity, id), None).await.unwrap();
    }
    handle.flush_snapshot().await.unwrap();

    // Mutations through version W live only in the log
    drive_history(&handle).await;
    let (version_before, tables_before) = fingerprint(&handle).await;
    drop(handle);

    let recovered = env.open().await;
    let (version_after, tables_after) = fingerprint(&recovered).await;

    assert_eq!(version_after, version_before);
    assert_eq!(tables_after, tables_before, "P2: replayed state differs");

    // Behavior agrees too, not just bytes
    let read = Capability::from("read");
    let (allowed, _) = recovered
        .can("user:alice", &read, "resource:doc1")
        .await
        .unwrap();
    assert!(allowed);
    let (allowed, _) = recovered
        .can("user:bob", &read, "resource:doc1")
        .await
        .unwrap();
    assert!(!allowed, "revocation must survive recovery");
}

#[tokio::test]
async fn test_snapshot_then_load_is_identity() {
    let env = TestEnv::new();
    let handle = env.open().await;
    drive_history(&handle).await;

    let (_, before) = fingerprint(&handle).await;
    handle.flush_snapshot().await.unwrap();
    drop(handle);

    // No log suffix at all: the snapshot alone must reproduce the state
    env.log.prune_through("acme", Version(1_000_000)).await.unwrap();
    let recovered = env.open().await;
    let (_, after) = fingerprint(&recovered).await;
    assert_eq!(before, after);
}

// =========================================================================
// P1: version monotonicity
// =========================================================================

#[tokio::test]
async fn test_versions_stay_dense_across_restart() {
    let env = TestEnv::new();
    let handle = env.open().await;
    drive_history(&handle).await;
    let before = handle.stats().await.current_version;
    handle.flush_snapshot().await.unwrap();
    drop(handle);

    let recovered = env.open().await;
    let outcome = recovered
        .apply(&upsert("user", "user:carol"), None)
        .await
        .unwrap();
    assert_eq!(outcome.version, Version(before.0 + 1), "no gap after restart");

    // The durable log is itself dense
    let entries = env
        .log
        .range("acme", Version(0), Version(u64::MAX))
        .await
        .unwrap();
    let versions: Vec<u64> = entries.iter().map(|e| e.version.0).collect();
    let expected: Vec<u64> = (1..=versions.len() as u64).collect();
    assert_eq!(versions, expected);
}

// =========================================================================
// Pruning
// =========================================================================

#[tokio::test]
async fn test_pruned_log_still_recovers() {
    let env = TestEnv::with_config(CoreConfig {
        max_catchup: 5,
        snapshot_mutation_threshold: 1000,
        ..CoreConfig::default()
    });
    let handle = env.open().await;

    handle.apply(&upsert("user", "user:seed"), None).await.unwrap();
    handle.apply(&upsert("resource", "resource:doc"), None).await.unwrap();
    for i in 0..200 {
        handle
            .apply(&upsert("user", &format!("user:u{i}")), None)
            .await
            .unwrap();
    }
    // Snapshot prunes everything older than the retention window
    handle.flush_snapshot().await.unwrap();
    let oldest = env.log.oldest("acme").await.unwrap().unwrap();
    assert!(oldest > Version(1), "old entries should be pruned");

    handle.apply(&upsert("user", "user:tail"), None).await.unwrap();
    let (version_before, tables_before) = fingerprint(&handle).await;
    drop(handle);

    let recovered = env.open().await;
    let (version_after, tables_after) = fingerprint(&recovered).await;
    assert_eq!(version_after, version_before);
    assert_eq!(tables_after, tables_before);
}

// =========================================================================
// Degraded mode
// =========================================================================

#[tokio::test]
async fn test_gap_in_log_degrades_tenant_to_read_only() {
    let env = TestEnv::new();
    let handle = env.open().await;
    handle.apply(&upsert("user", "user:alice"), None).await.unwrap();
    handle.flush_snapshot().await.unwrap();
    handle.apply(&upsert("user", "user:bob"), None).await.unwrap();
    handle.apply(&upsert("user", "user:carol"), None).await.unwrap();
    drop(handle);

    // Lose version 2: replay must halt at the gap
    env.log.prune_through("acme", Version(2)).await.unwrap();

    let recovered = env.open().await;
    let stats = recovered.stats().await;
    assert!(stats.degraded);
    // State is the snapshot; the unreachable suffix was not applied
    assert_eq!(stats.current_version, Version(1));

    let err = recovered
        .apply(&upsert("user", "user:dave"), None)
        .await
        .unwrap_err();
    assert_eq!(err.category(), "DegradedReadOnly");

    // Reads still answer
    let (allowed, _) = recovered
        .can("user:alice", &Capability::from("read"), "resource:doc1")
        .await
        .unwrap();
    assert!(!allowed);
}
