//! Mutation Log Types
//!
//! Every accepted state change in a tenant becomes a [`MutationEntry`] with a
//! dense monotone [`Version`]. The entry is the unit of durability (mirrored
//! to the key-value log), of fan-out (broadcast to connections), and of
//! recovery (replayed over a snapshot).

use crate::models::edge::{Capability, EdgeId, EdgeRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotone mutation version within a tenant
///
/// Versions are dense integers starting at 1; `Version(0)` means "nothing
/// seen yet" (a brand-new client or an empty tenant).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// The version before any mutation has committed
    pub const ZERO: Version = Version(0);

    /// The next version in sequence
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }

    /// How far `self` lags behind `other` (saturating)
    pub fn lag_behind(self, other: Version) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The kind of a committed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Grant,
    Revoke,
    UpsertEntity,
    DeleteEntity,
    SchemaChange,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Grant => "grant",
            MutationKind::Revoke => "revoke",
            MutationKind::UpsertEntity => "upsert_entity",
            MutationKind::DeleteEntity => "delete_entity",
            MutationKind::SchemaChange => "schema_change",
        };
        f.write_str(name)
    }
}

/// The payload of a committed mutation
///
/// Payloads carry everything needed to re-apply the mutation during replay
/// without consulting anything but prior state: a grant embeds the full
/// minted edge, a cascading delete lists the edges it revoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationPayload {
    Grant { edge: EdgeRecord },

    Revoke {
        edge_id: EdgeId,
        relation: String,
        source: String,
        target: String,
    },

    UpsertEntity {
        entity: String,
        row: serde_json::Map<String, serde_json::Value>,
    },

    DeleteEntity {
        entity: String,
        id: String,
        /// Edges revoked by cascade as part of this delete
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        revoked_edges: Vec<EdgeId>,
    },

    SchemaChange { schema_version: u32 },
}

impl MutationPayload {
    /// The kind tag of this payload
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::Grant { .. } => MutationKind::Grant,
            MutationPayload::Revoke { .. } => MutationKind::Revoke,
            MutationPayload::UpsertEntity { .. } => MutationKind::UpsertEntity,
            MutationPayload::DeleteEntity { .. } => MutationKind::DeleteEntity,
            MutationPayload::SchemaChange { .. } => MutationKind::SchemaChange,
        }
    }
}

/// One committed, versioned mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEntry {
    /// Dense monotone version within the tenant
    pub version: Version,

    /// What changed
    #[serde(flatten)]
    pub payload: MutationPayload,

    /// Wall-clock commit time
    pub committed_at: DateTime<Utc>,

    /// Authenticated operator that requested the mutation, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl MutationEntry {
    pub fn new(version: Version, payload: MutationPayload, actor: Option<String>) -> Self {
        Self {
            version,
            payload,
            committed_at: Utc::now(),
            actor,
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.payload.kind()
    }
}

/// A client-submitted mutation request, before validation and versioning
///
/// This is the body of `POST /{tenant}/grant`, `/revoke`, `/bulk` operations
/// and the `mutate` WebSocket frame. The relationship name travels as `type`
/// on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationRequest {
    Grant {
        #[serde(rename = "type")]
        relation: String,
        source: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },

    Revoke {
        #[serde(flatten)]
        target: RevokeTarget,
    },

    UpsertEntity {
        entity: String,
        row: serde_json::Map<String, serde_json::Value>,
    },

    DeleteEntity { entity: String, id: String },
}

/// The two accepted forms of a revoke request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RevokeTarget {
    /// Primary form: revoke by edge id
    ById { edge_id: EdgeId },

    /// Convenience form: revoke the live edge matching the tuple
    ByTuple {
        #[serde(rename = "type")]
        relation: String,
        source: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capability: Option<Capability>,
    },
}

/// Result of a committed mutation, reported back to the originator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationOutcome {
    /// Version assigned to the mutation; for an idempotent repeat grant this
    /// is the current version (no new entry was created)
    pub version: Version,

    /// Edge id minted or matched, for grant/revoke operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<EdgeId>,

    /// True when a grant matched an existing live edge instead of minting
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub idempotent: bool,
}
