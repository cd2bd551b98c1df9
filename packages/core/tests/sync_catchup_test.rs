//! WebSocket sync: broadcast ordering, catch-up, full resync
//!
//! Tests drive the hub through the tenant handle exactly the way the socket
//! task does, with the receiver half of each connection's send queue
//! standing in for the wire.
//!
//! Tests cover:
//! - P5: per-connection version streams are gapless and strictly increasing
//! - P6: catch-up contains exactly the missing range
//! - Scenario 5: reconnect at version 10 after 17 commits
//! - Scenario 6: reconnect beyond retention forces a full resync
//! - Slow consumers are disconnected, not buffered forever
//! - Optimistic mutations answer exactly one ack or reject

use edgewarden_core::config::CoreConfig;
use edgewarden_core::db::{MemoryMutationLog, MemoryObjectStore};
use edgewarden_core::models::mutation::{MutationRequest, Version};
use edgewarden_core::sync::frames::ServerFrame;
use edgewarden_core::sync::hub::HandshakeOutcome;
use edgewarden_core::tenant::TenantHandle;
use std::sync::Arc;
use tokio::sync::mpsc;

async fn create_test_env(config: CoreConfig) -> Arc<TenantHandle> {
    TenantHandle::open(
        "acme",
        Arc::new(MemoryObjectStore::new()),
        Arc::new(MemoryMutationLog::new()),
        Arc::new(config),
    )
    .await
    .unwrap()
}

fn upsert(id: u64) -> MutationRequest {
    MutationRequest::UpsertEntity {
        entity: "user".to_string(),
        row: serde_json::json!({ "id": format!("user:u{id}") })
            .as_object()
            .unwrap()
            .clone(),
    }
}

fn drain(receiver: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = receiver.try_recv() {
        frames.push(frame);
    }
    frames
}

fn mutation_versions(frames: &[ServerFrame]) -> Vec<u64> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ServerFrame::Mutation { version, .. } => Some(version.0),
            _ => None,
        })
        .collect()
}

// =========================================================================
// P5: broadcast ordering
// =========================================================================

#[tokio::test]
async fn test_stream_is_gapless_and_strictly_increasing() {
    let handle = create_test_env(CoreConfig::default()).await;
    let (id, mut receiver) = handle.connect().await.unwrap();
    assert_eq!(
        handle.handshake(id, Version(0)).await,
        HandshakeOutcome::Streaming
    );

    for i in 0..20 {
        handle.apply(&upsert(i), None).await.unwrap();
    }

    let versions = mutation_versions(&drain(&mut receiver));
    let expected: Vec<u64> = (1..=20).collect();
    assert_eq!(versions, expected, "P5: gap or duplicate in the stream");
}

#[tokio::test]
async fn test_two_connections_see_the_same_order() {
    let handle = create_test_env(CoreConfig::default()).await;
    let (a, mut rx_a) = handle.connect().await.unwrap();
    let (b, mut rx_b) = handle.connect().await.unwrap();
    handle.handshake(a, Version(0)).await;
    handle.handshake(b, Version(0)).await;

    for i in 0..10 {
        handle.apply(&upsert(i), None).await.unwrap();
    }

    assert_eq!(
        mutation_versions(&drain(&mut rx_a)),
        mutation_versions(&drain(&mut rx_b))
    );
}

// =========================================================================
// Scenario 5 + P6: catch-up
// =========================================================================

#[tokio::test]
async fn test_reconnect_catch_up_contains_exact_range() {
    let handle = create_test_env(CoreConfig::default()).await;

    // Client A sees versions 1..=10 and disconnects
    let (a, mut rx_a) = handle.connect().await.unwrap();
    handle.handshake(a, Version(0)).await;
    for i in 0..10 {
        handle.apply(&upsert(i), None).await.unwrap();
    }
    assert_eq!(mutation_versions(&drain(&mut rx_a)).len(), 10);
    handle
        .disconnect(a, edgewarden_core::sync::hub::CloseReason::ClientDisconnected)
        .await;

    // 17 mutations commit while A is away
    for i in 10..27 {
        handle.apply(&upsert(i), None).await.unwrap();
    }

    // A reconnects declaring version 10
    let (a2, mut rx_a2) = handle.connect().await.unwrap();
    let outcome = handle.handshake(a2, Version(10)).await;
    assert_eq!(outcome, HandshakeOutcome::Streaming);

    let frames = drain(&mut rx_a2);
    match &frames[0] {
        ServerFrame::CatchUp { from, to, mutations } => {
            assert_eq!(*from, Version(10));
            assert_eq!(*to, Version(27));
            assert_eq!(mutations.len(), 17);
            let versions: Vec<u64> = mutations.iter().map(|m| m.version.0).collect();
            let expected: Vec<u64> = (11..=27).collect();
            assert_eq!(versions, expected, "P6: catch-up range mismatch");
        }
        other => panic!("expected catch_up, got {other:?}"),
    }

    // And the stream continues gaplessly after the backfill
    handle.apply(&upsert(27), None).await.unwrap();
    assert_eq!(mutation_versions(&drain(&mut rx_a2)), vec![28]);
}

#[tokio::test]
async fn test_caught_up_client_gets_no_backfill() {
    let handle = create_test_env(CoreConfig::default()).await;
    for i in 0..5 {
        handle.apply(&upsert(i), None).await.unwrap();
    }

    let (id, mut receiver) = handle.connect().await.unwrap();
    handle.handshake(id, Version(5)).await;
    assert!(drain(&mut receiver).is_empty());
}

// =========================================================================
// Scenario 6: full resync
// =========================================================================

#[tokio::test]
async fn test_reconnect_beyond_catchup_window_requires_full_sync() {
    let handle = create_test_env(CoreConfig::default()).await;
    for i in 0..150 {
        handle.apply(&upsert(i), None).await.unwrap();
    }

    // Lag 145 exceeds MAX_CATCHUP = 100
    let (id, mut receiver) = handle.connect().await.unwrap();
    let outcome = handle.handshake(id, Version(5)).await;
    assert_eq!(outcome, HandshakeOutcome::FullResyncRequired);
    assert!(matches!(
        drain(&mut receiver)[0],
        ServerFrame::FullSyncRequired { .. }
    ));
}

#[tokio::test]
async fn test_reconnect_beyond_retention_requires_full_sync() {
    // A small retention window: max_catchup 10 keeps 110 mirrored entries
    let handle = create_test_env(CoreConfig {
        max_catchup: 10,
        ..CoreConfig::default()
    })
    .await;
    for i in 0..200 {
        handle.apply(&upsert(i), None).await.unwrap();
    }

    // Version 5 predates the oldest retained entry
    let (id, mut receiver) = handle.connect().await.unwrap();
    let outcome = handle.handshake(id, Version(5)).await;
    assert_eq!(outcome, HandshakeOutcome::FullResyncRequired);
    match &drain(&mut receiver)[0] {
        ServerFrame::FullSyncRequired { reason } => {
            assert_eq!(reason, "beyond retention");
        }
        other => panic!("expected full_sync_required, got {other:?}"),
    }

    // After a fresh snapshot fetch the client resumes from current
    let current = handle.stats().await.current_version;
    let outcome = handle.handshake(id, current).await;
    assert_eq!(outcome, HandshakeOutcome::Streaming);
}

// =========================================================================
// Back-pressure
// =========================================================================

#[tokio::test]
async fn test_slow_consumer_is_disconnected() {
    let handle = create_test_env(CoreConfig {
        send_queue_capacity: 4,
        ..CoreConfig::default()
    })
    .await;

    let (id, receiver) = handle.connect().await.unwrap();
    handle.handshake(id, Version(0)).await;
    assert_eq!(handle.stats().await.connections, 1);

    // Never drain the queue; overflow closes the connection
    for i in 0..10 {
        handle.apply(&upsert(i), None).await.unwrap();
    }
    assert_eq!(handle.stats().await.connections, 0);
    drop(receiver);
}

// =========================================================================
// Optimistic mutations
// =========================================================================

#[tokio::test]
async fn test_mutate_yields_exactly_one_ack_or_reject() {
    let handle = create_test_env(CoreConfig::default()).await;
    let (id, mut receiver) = handle.connect().await.unwrap();
    handle.handshake(id, Version(0)).await;

    handle
        .client_mutate(id, upsert(1), "ok-1".to_string())
        .await;
    handle
        .client_mutate(
            id,
            MutationRequest::DeleteEntity {
                entity: "user".to_string(),
                id: "user:ghost".to_string(),
            },
            "bad-1".to_string(),
        )
        .await;

    let frames = drain(&mut receiver);
    let acks: Vec<&ServerFrame> = frames
        .iter()
        .filter(|f| matches!(f, ServerFrame::Ack { .. } | ServerFrame::Reject { .. }))
        .collect();
    assert_eq!(acks.len(), 2);
    match acks[0] {
        ServerFrame::Ack { client_id, version } => {
            assert_eq!(client_id, "ok-1");
            assert_eq!(*version, Version(1));
        }
        other => panic!("expected ack, got {other:?}"),
    }
    match acks[1] {
        ServerFrame::Reject { client_id, reason } => {
            assert_eq!(client_id, "bad-1");
            assert_eq!(reason, "UnknownEntity");
        }
        other => panic!("expected reject, got {other:?}"),
    }
}
