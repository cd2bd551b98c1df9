//! Sync Hub
//!
//! Connection registry and fan-out for one tenant. Every committed mutation
//! is delivered to every streaming connection in strictly increasing version
//! order, exactly once per connection lifetime; reconnecting clients are
//! caught up from the ledger mirror or told to resync from a snapshot.
//!
//! # Ordering
//!
//! The hub is owned by the tenant state and only touched under its lock:
//! broadcasts happen in commit order, and a `version` handshake is atomic
//! with respect to commits, so a catch-up batch and the stream that follows
//! it can neither overlap nor leave a gap.
//!
//! # Back-pressure
//!
//! Each connection has a bounded send queue. A connection that cannot drain
//! it in time is closed as a slow consumer; reliability is the client's
//! `version` frame on reconnect, not unbounded buffering.

use crate::models::mutation::{MutationEntry, MutationPayload, Version};
use crate::sync::frames::{MutationFrame, ServerFrame};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique id for one WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, waiting for the client's `version` frame
    Open,
    /// Backfill in progress
    CatchUp,
    /// Receiving live mutations
    Streaming,
    /// Terminal
    Closed,
}

/// Why the hub closed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    IdleEvicted,
    SlowConsumer,
    ServerShutdown,
}

struct Connection {
    sender: mpsc::Sender<ServerFrame>,
    state: ConnectionState,
    last_seen_version: Version,
    last_activity: Instant,
}

/// Outcome of a `version` handshake
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Client is current or was caught up from the mirror; now streaming
    Streaming,
    /// Client must discard local state and reload a snapshot
    FullResyncRequired,
}

/// Per-tenant connection registry and broadcaster
pub struct SyncHub {
    connections: HashMap<ConnectionId, Connection>,
    send_queue_capacity: usize,
    max_catchup: u64,
}

impl SyncHub {
    pub fn new(send_queue_capacity: usize, max_catchup: u64) -> Self {
        Self {
            connections: HashMap::new(),
            send_queue_capacity,
            max_catchup,
        }
    }

    /// Register a freshly upgraded connection
    ///
    /// Returns the connection id and the receiving half of its send queue;
    /// the socket task forwards frames from the receiver to the wire.
    pub fn register(&mut self) -> (ConnectionId, mpsc::Receiver<ServerFrame>) {
        let (sender, receiver) = mpsc::channel(self.send_queue_capacity);
        let id = ConnectionId::generate();
        self.connections.insert(
            id,
            Connection {
                sender,
                state: ConnectionState::Open,
                last_seen_version: Version::ZERO,
                last_activity: Instant::now(),
            },
        );
        debug!(connection = %id, "connection registered");
        (id, receiver)
    }

    /// Handle the client's `version` frame
    ///
    /// Catch-up is served from the ledger's in-memory mirror via
    /// `entries_after`; a `None` from the caller means the requested history
    /// is no longer retained.
    pub fn handle_version(
        &mut self,
        id: ConnectionId,
        client_version: Version,
        current_version: Version,
        entries_after: Option<Vec<MutationEntry>>,
    ) -> HandshakeOutcome {
        let Some(connection) = self.connections.get_mut(&id) else {
            return HandshakeOutcome::FullResyncRequired;
        };
        connection.last_activity = Instant::now();

        // History older than the retained log always forces a resync, even
        // when the lag alone would also have; the reason tells the client
        // which bound it hit
        let Some(entries) = entries_after else {
            let _ = connection.sender.try_send(ServerFrame::FullSyncRequired {
                reason: "beyond retention".to_string(),
            });
            return HandshakeOutcome::FullResyncRequired;
        };

        let lag = client_version.lag_behind(current_version);
        if lag > self.max_catchup {
            let _ = connection.sender.try_send(ServerFrame::FullSyncRequired {
                reason: "lag exceeds catch-up window".to_string(),
            });
            return HandshakeOutcome::FullResyncRequired;
        }

        if !entries.is_empty() {
            connection.state = ConnectionState::CatchUp;
            let frame = ServerFrame::CatchUp {
                from: client_version,
                to: current_version,
                mutations: entries.iter().map(MutationFrame::from).collect(),
            };
            if connection.sender.try_send(frame).is_err() {
                self.close(id, CloseReason::SlowConsumer);
                return HandshakeOutcome::FullResyncRequired;
            }
        }

        if let Some(connection) = self.connections.get_mut(&id) {
            connection.state = ConnectionState::Streaming;
            connection.last_seen_version = current_version;
        }
        HandshakeOutcome::Streaming
    }

    /// Fan one committed mutation out to every streaming connection
    ///
    /// Called in commit order under the tenant lock. A connection whose
    /// queue is full is closed as a slow consumer rather than blocking the
    /// writer or reordering its stream.
    pub fn broadcast(&mut self, entry: &MutationEntry) {
        let schema_change = match &entry.payload {
            MutationPayload::SchemaChange { schema_version } => Some(*schema_version),
            _ => None,
        };

        let mut slow: Vec<ConnectionId> = Vec::new();
        for (id, connection) in &mut self.connections {
            if connection.state != ConnectionState::Streaming {
                continue;
            }
            let frame = ServerFrame::Mutation {
                version: entry.version,
                op: entry.payload.clone(),
            };
            match connection.sender.try_send(frame) {
                Ok(()) => {
                    connection.last_seen_version = entry.version;
                    if let Some(version) = schema_change {
                        // Best-effort companion frame; the mutation stream
                        // itself already carries the change
                        let _ = connection
                            .sender
                            .try_send(ServerFrame::SchemaChange { version });
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => slow.push(*id),
                Err(mpsc::error::TrySendError::Closed(_)) => slow.push(*id),
            }
        }
        for id in slow {
            self.close(id, CloseReason::SlowConsumer);
        }
    }

    /// Send a frame to one connection (acks, rejects, pongs)
    pub fn send_to(&mut self, id: ConnectionId, frame: ServerFrame) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        if connection.sender.try_send(frame).is_err() {
            self.close(id, CloseReason::SlowConsumer);
        }
    }

    /// Note client activity (any inbound frame)
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.last_activity = Instant::now();
        }
    }

    /// Close one connection
    pub fn close(&mut self, id: ConnectionId, reason: CloseReason) {
        if let Some(mut connection) = self.connections.remove(&id) {
            connection.state = ConnectionState::Closed;
            match reason {
                CloseReason::SlowConsumer => {
                    warn!(connection = %id, "connection closed: slow consumer")
                }
                CloseReason::IdleEvicted => {
                    info!(connection = %id, "connection closed: idle")
                }
                _ => debug!(connection = %id, ?reason, "connection closed"),
            }
            // Dropping the sender ends the socket task's forward loop
        }
    }

    /// Evict connections idle longer than `timeout`; returns how many
    pub fn sweep_idle(&mut self, timeout: Duration) -> usize {
        let idle: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.last_activity.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        let count = idle.len();
        for id in idle {
            self.close(id, CloseReason::IdleEvicted);
        }
        count
    }

    /// Close everything (server shutdown or tenant eviction)
    pub fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close(id, CloseReason::ServerShutdown);
        }
    }

    /// Live (non-closed) connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mutation::MutationPayload;

    fn entry(version: u64) -> MutationEntry {
        MutationEntry::new(
            Version(version),
            MutationPayload::SchemaChange {
                schema_version: version as u32,
            },
            None,
        )
    }

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<MutationEntry> {
        range.map(entry).collect()
    }

    #[test]
    fn test_handshake_current_client_streams_immediately() {
        let mut hub = SyncHub::new(16, 100);
        let (id, mut receiver) = hub.register();

        let outcome = hub.handle_version(id, Version(5), Version(5), Some(Vec::new()));
        assert_eq!(outcome, HandshakeOutcome::Streaming);
        assert!(receiver.try_recv().is_err(), "no frames for a current client");
    }

    #[test]
    fn test_handshake_catch_up_contains_exact_range() {
        let mut hub = SyncHub::new(16, 100);
        let (id, mut receiver) = hub.register();

        // Client at 10, server at 27: exactly 17 mutations
        let outcome =
            hub.handle_version(id, Version(10), Version(27), Some(entries(11..=27)));
        assert_eq!(outcome, HandshakeOutcome::Streaming);

        let frame = receiver.try_recv().unwrap();
        match frame {
            ServerFrame::CatchUp { from, to, mutations } => {
                assert_eq!(from, Version(10));
                assert_eq!(to, Version(27));
                assert_eq!(mutations.len(), 17);
                assert_eq!(mutations[0].version, Version(11));
                assert_eq!(mutations[16].version, Version(27));
            }
            other => panic!("expected catch_up, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_beyond_window_requires_full_sync() {
        let mut hub = SyncHub::new(16, 100);
        let (id, mut receiver) = hub.register();

        let outcome = hub.handle_version(id, Version(5), Version(300), Some(Vec::new()));
        assert_eq!(outcome, HandshakeOutcome::FullResyncRequired);
        assert!(matches!(
            receiver.try_recv().unwrap(),
            ServerFrame::FullSyncRequired { .. }
        ));
    }

    #[test]
    fn test_handshake_beyond_retention_requires_full_sync() {
        let mut hub = SyncHub::new(16, 100);
        let (id, mut receiver) = hub.register();

        // Lag is small but the mirror no longer holds the range
        let outcome = hub.handle_version(id, Version(5), Version(50), None);
        assert_eq!(outcome, HandshakeOutcome::FullResyncRequired);
        match receiver.try_recv().unwrap() {
            ServerFrame::FullSyncRequired { reason } => {
                assert_eq!(reason, "beyond retention")
            }
            other => panic!("expected full_sync_required, got {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_reaches_streaming_connections_only() {
        let mut hub = SyncHub::new(16, 100);
        let (streaming, mut streaming_rx) = hub.register();
        let (open, mut open_rx) = hub.register();

        hub.handle_version(streaming, Version(0), Version(0), Some(Vec::new()));
        // `open` never sent its version frame

        hub.broadcast(&entry(1));

        assert!(matches!(
            streaming_rx.try_recv().unwrap(),
            ServerFrame::Mutation {
                version: Version(1),
                ..
            }
        ));
        // Schema change payload carries a companion frame
        assert!(matches!(
            streaming_rx.try_recv().unwrap(),
            ServerFrame::SchemaChange { version: 1 }
        ));
        assert!(open_rx.try_recv().is_err());
        let _ = open;
    }

    #[test]
    fn test_broadcast_order_is_version_order() {
        let mut hub = SyncHub::new(16, 100);
        let (id, mut receiver) = hub.register();
        hub.handle_version(id, Version(0), Version(0), Some(Vec::new()));

        for v in 1..=5 {
            hub.broadcast(&entry(v));
        }

        let mut seen = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            if let ServerFrame::Mutation { version, .. } = frame {
                seen.push(version.0);
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_slow_consumer_is_closed() {
        let mut hub = SyncHub::new(2, 100);
        let (id, receiver) = hub.register();
        hub.handle_version(id, Version(0), Version(0), Some(Vec::new()));

        // Never drain the receiver; the third broadcast overflows the queue
        for v in 1..=3 {
            hub.broadcast(&entry(v));
        }
        assert_eq!(hub.connection_count(), 0);
        drop(receiver);
    }

    #[test]
    fn test_idle_sweep() {
        let mut hub = SyncHub::new(16, 100);
        let (id, _receiver) = hub.register();
        hub.handle_version(id, Version(0), Version(0), Some(Vec::new()));

        assert_eq!(hub.sweep_idle(Duration::from_secs(60)), 0);
        assert_eq!(hub.sweep_idle(Duration::ZERO), 1);
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn test_close_all() {
        let mut hub = SyncHub::new(16, 100);
        hub.register();
        hub.register();
        assert_eq!(hub.connection_count(), 2);

        hub.close_all();
        assert_eq!(hub.connection_count(), 0);
    }
}
