//! Edge Records
//!
//! An edge is a server-minted relationship instance between two entity
//! instances. Edge ids are 128-bit UUIDs so that holding an id is itself
//! unguessable evidence of having been told about the edge; edge-path proofs
//! are lists of these ids.
//!
//! Revocation is soft: the record stays in the ledger and its table with the
//! revoking version recorded, so historical proof validation can distinguish
//! "never existed" from "was live then".

use crate::models::mutation::Version;
use crate::models::schema::RelationKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique, unguessable edge identifier
///
/// Serialized as the UUID's hyphenated string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EdgeId(Uuid);

impl EdgeId {
    /// Mint a fresh random edge id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id from its string form
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A capability string carried on permission edges (e.g. `read`, `admin`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One relationship instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Server-minted unguessable id
    pub id: EdgeId,

    /// Relationship name as declared by the schema
    pub relation: String,

    /// Authorization classification, denormalized from the schema at grant
    /// time so liveness and traversal checks never need a schema lookup
    pub kind: RelationKind,

    /// Source entity instance id
    pub source: String,

    /// Target entity instance id
    pub target: String,

    /// Capability carried by permission edges
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,

    /// Declared edge properties (includes `capability` for permission edges)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,

    /// Version of the mutation that created this edge
    pub created_version: Version,

    /// Version of the mutation that revoked this edge; unset while live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_version: Option<Version>,
}

impl EdgeRecord {
    /// Whether the edge is live right now
    pub fn is_live(&self) -> bool {
        self.revoked_version.is_none()
    }

    /// Whether the edge was live as of the given evaluation version
    ///
    /// An edge revoked at version R was still live for any evaluation at
    /// version V < R. The edge must also have existed by then.
    pub fn is_live_at(&self, version: Version) -> bool {
        if self.created_version > version {
            return false;
        }
        match self.revoked_version {
            None => true,
            Some(revoked) => revoked > version,
        }
    }

    /// Project this edge onto its relationship-table row
    ///
    /// Bookkeeping columns first, declared properties after, matching the
    /// compiled table's column order.
    pub fn to_row(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut row = serde_json::Map::new();
        row.insert("source_id".to_string(), self.source.clone().into());
        row.insert("target_id".to_string(), self.target.clone().into());
        row.insert("edge_id".to_string(), self.id.to_string().into());
        row.insert(
            "created_version".to_string(),
            serde_json::Value::from(self.created_version.0),
        );
        if let Some(revoked) = self.revoked_version {
            row.insert(
                "revoked_version".to_string(),
                serde_json::Value::from(revoked.0),
            );
        }
        for (name, value) in &self.properties {
            row.insert(name.clone(), value.clone());
        }
        row
    }

    /// Reconstruct an edge from its relationship-table row
    ///
    /// Used when rebuilding the ledger from a loaded snapshot. Returns
    /// `None` when the bookkeeping columns are absent or malformed.
    pub fn from_row(
        relation: &str,
        kind: RelationKind,
        row: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<Self> {
        let source = row.get("source_id")?.as_str()?.to_string();
        let target = row.get("target_id")?.as_str()?.to_string();
        let id = EdgeId::parse(row.get("edge_id")?.as_str()?)?;
        let created_version = Version(row.get("created_version")?.as_u64()?);
        let revoked_version = row
            .get("revoked_version")
            .and_then(|v| v.as_u64())
            .map(Version);

        let mut properties = serde_json::Map::new();
        for (name, value) in row {
            if !crate::models::compiled::RELATIONSHIP_SYSTEM_COLUMNS.contains(&name.as_str()) {
                properties.insert(name.clone(), value.clone());
            }
        }
        let capability = properties
            .get("capability")
            .and_then(|v| v.as_str())
            .map(Capability::from);

        Some(Self {
            id,
            relation: relation.to_string(),
            kind,
            source,
            target,
            capability,
            properties,
            created_version,
            revoked_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_edge() -> EdgeRecord {
        EdgeRecord {
            id: EdgeId::generate(),
            relation: "has_permission".to_string(),
            kind: RelationKind::Permission,
            source: "user:alice".to_string(),
            target: "resource:doc1".to_string(),
            capability: Some(Capability::from("read")),
            properties: serde_json::Map::new(),
            created_version: Version(3),
            revoked_version: None,
        }
    }

    #[test]
    fn test_edge_id_round_trip() {
        let id = EdgeId::generate();
        let parsed = EdgeId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);

        assert!(EdgeId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_edge_id_serializes_as_string() {
        let id = EdgeId::generate();
        let json = serde_json::to_value(id).unwrap();
        assert!(json.is_string());
        assert_eq!(json.as_str().unwrap(), id.to_string());
    }

    #[test]
    fn test_liveness_now() {
        let mut edge = sample_edge();
        assert!(edge.is_live());

        edge.revoked_version = Some(Version(9));
        assert!(!edge.is_live());
    }

    #[test]
    fn test_liveness_at_version() {
        let mut edge = sample_edge();
        edge.revoked_version = Some(Version(9));

        // Not yet created
        assert!(!edge.is_live_at(Version(2)));
        // Live window [3, 9)
        assert!(edge.is_live_at(Version(3)));
        assert!(edge.is_live_at(Version(8)));
        // Revoked from version 9 on
        assert!(!edge.is_live_at(Version(9)));
        assert!(!edge.is_live_at(Version(100)));
    }
}
