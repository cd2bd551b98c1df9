//! WebSocket Frame Envelope
//!
//! Every frame is a JSON object with a `type` tag. Clients send `version`,
//! `mutate`, and `ping`; the server answers with the streaming, catch-up,
//! acknowledgement, and error frames below.
//!
//! Mutations travel as `(version, op)` pairs, where `op` is the committed
//! mutation payload (including its own `kind` tag), so a client can apply
//! frames and log entries with the same code path.

use crate::models::mutation::{MutationEntry, MutationPayload, MutationRequest, Version};
use serde::{Deserialize, Serialize};

/// Frames a client may send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Last-seen version declaration, sent once after the upgrade
    /// (0 for a brand-new client)
    Version { version: Version },

    /// Optimistic mutation submission; `client_id` correlates the eventual
    /// `ack` or `reject`
    Mutate {
        op: MutationRequest,
        client_id: String,
    },

    /// Application-level heartbeat
    Ping,
}

/// One `(version, op)` pair inside a catch-up batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationFrame {
    pub version: Version,
    pub op: MutationPayload,
}

impl From<&MutationEntry> for MutationFrame {
    fn from(entry: &MutationEntry) -> Self {
        Self {
            version: entry.version,
            op: entry.payload.clone(),
        }
    }
}

/// Frames the server may send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// One newly committed mutation, streamed in version order
    Mutation { version: Version, op: MutationPayload },

    /// Backfill of the mutations in `(from, to]`, in order
    CatchUp {
        from: Version,
        to: Version,
        mutations: Vec<MutationFrame>,
    },

    /// The client-submitted mutation identified by `client_id` committed
    Ack { client_id: String, version: Version },

    /// The client-submitted mutation identified by `client_id` was refused
    Reject { client_id: String, reason: String },

    /// The client is too far behind; discard local state and reload a
    /// snapshot
    FullSyncRequired { reason: String },

    /// A new schema version is active; clients should resynchronize their
    /// compiled schema
    SchemaChange { version: u32 },

    /// Answer to a client `ping`
    Pong,

    /// Terminal protocol error
    Error { message: String },
}
