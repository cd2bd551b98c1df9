//! Edge Ledger
//!
//! The authoritative, linearizable record of state change for one tenant.
//! Every accepted mutation becomes a [`MutationEntry`] with the next dense
//! version; edges live here forever (revocation is a tombstone, never a
//! removal), which is what makes historical proof validation possible.
//!
//! The ledger also keeps a bounded in-memory mirror of recent entries for
//! catch-up sync; the durable key-value log holds the authoritative copy.

use crate::models::edge::{Capability, EdgeId, EdgeRecord};
use crate::models::mutation::{MutationEntry, MutationPayload, Version};
use crate::models::schema::RelationKind;
use crate::services::error::ServiceError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::debug;

/// Identity of a live edge for duplicate-grant detection
///
/// `capability` participates in the key, so a `member_of` edge and a
/// permission edge between the same nodes never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TupleKey {
    relation: String,
    source: String,
    target: String,
    capability: Option<Capability>,
}

/// Result of a grant: either freshly minted or an idempotent repeat
#[derive(Debug)]
pub enum GrantOutcome {
    /// A live edge with the identical tuple already exists
    Existing(EdgeId),
    /// A new edge was minted and a ledger entry appended
    Minted(EdgeRecord, MutationEntry),
}

/// Append-only mutation record with edge tombstones
#[derive(Debug)]
pub struct EdgeLedger {
    /// Every edge ever minted, revoked ones included
    edges: HashMap<EdgeId, EdgeRecord>,

    /// Live tuple -> edge id, for idempotent grants and tuple revokes
    live_tuples: HashMap<TupleKey, EdgeId>,

    /// Node id -> live edges touching it, for delete-entity checks
    live_by_node: HashMap<String, HashSet<EdgeId>>,

    /// Bounded mirror of recent entries for catch-up
    recent: VecDeque<MutationEntry>,

    /// How many recent entries to mirror in memory
    retention: usize,

    /// Latest committed version
    current_version: Version,

    /// Version the last durable snapshot is up to date with
    snapshot_version: Version,

    /// When the last mutation committed, for idle snapshot triggers
    last_mutation_at: Option<Instant>,
}

impl EdgeLedger {
    pub fn new(retention: usize) -> Self {
        Self {
            edges: HashMap::new(),
            live_tuples: HashMap::new(),
            live_by_node: HashMap::new(),
            recent: VecDeque::new(),
            retention,
            current_version: Version::ZERO,
            snapshot_version: Version::ZERO,
            last_mutation_at: None,
        }
    }

    // ---- Accessors --------------------------------------------------------

    pub fn current_version(&self) -> Version {
        self.current_version
    }

    pub fn snapshot_version(&self) -> Version {
        self.snapshot_version
    }

    /// Committed mutations since the last snapshot
    pub fn mutations_since_snapshot(&self) -> u64 {
        self.snapshot_version.lag_behind(self.current_version)
    }

    /// Time since the last mutation, if any committed yet
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        self.last_mutation_at.map(|at| at.elapsed())
    }

    /// Look up an edge, tombstones included
    pub fn edge(&self, id: EdgeId) -> Option<&EdgeRecord> {
        self.edges.get(&id)
    }

    /// Whether an edge is currently live
    pub fn is_live(&self, id: EdgeId) -> bool {
        self.edges.get(&id).map(|e| e.is_live()).unwrap_or(false)
    }

    /// Total edges ever minted
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Live edges only
    pub fn live_edge_count(&self) -> usize {
        self.edges.values().filter(|e| e.is_live()).count()
    }

    /// All edges, for index rebuilds
    pub fn iter_edges(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.edges.values()
    }

    /// Live edges touching a node in either direction
    pub fn live_edges_touching(&self, node: &str) -> Vec<EdgeRecord> {
        self.live_by_node
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|id| self.edges.get(id))
            .filter(|e| e.is_live())
            .cloned()
            .collect()
    }

    /// The live edge matching a tuple, if any
    pub fn find_live_tuple(
        &self,
        relation: &str,
        source: &str,
        target: &str,
        capability: Option<&Capability>,
    ) -> Option<EdgeId> {
        self.live_tuples
            .get(&TupleKey {
                relation: relation.to_string(),
                source: source.to_string(),
                target: target.to_string(),
                capability: capability.cloned(),
            })
            .copied()
    }

    /// Recent entries with versions strictly greater than `after`
    ///
    /// Served from the in-memory mirror; `None` when `after` predates the
    /// mirror (the caller must fall back to the durable log or a resync).
    pub fn entries_after(&self, after: Version) -> Option<Vec<MutationEntry>> {
        if after >= self.current_version {
            return Some(Vec::new());
        }
        let oldest = self.recent.front().map(|e| e.version)?;
        if after.next() < oldest {
            return None;
        }
        Some(
            self.recent
                .iter()
                .filter(|e| e.version > after)
                .cloned()
                .collect(),
        )
    }

    /// Oldest version still in the in-memory mirror
    pub fn oldest_mirrored(&self) -> Option<Version> {
        self.recent.front().map(|e| e.version)
    }

    // ---- Mutations --------------------------------------------------------

    /// Grant an edge
    ///
    /// The caller has already verified that source and target exist with the
    /// types the relationship declares. A live duplicate of the full tuple is
    /// returned idempotently without minting anything.
    #[allow(clippy::too_many_arguments)]
    pub fn grant(
        &mut self,
        relation: &str,
        kind: RelationKind,
        source: &str,
        target: &str,
        capability: Option<Capability>,
        properties: serde_json::Map<String, serde_json::Value>,
        actor: Option<String>,
    ) -> GrantOutcome {
        if let Some(existing) = self.find_live_tuple(relation, source, target, capability.as_ref())
        {
            debug!(%existing, relation, source, target, "idempotent grant matched live edge");
            return GrantOutcome::Existing(existing);
        }

        let version = self.current_version.next();
        let edge = EdgeRecord {
            id: EdgeId::generate(),
            relation: relation.to_string(),
            kind,
            source: source.to_string(),
            target: target.to_string(),
            capability,
            properties,
            created_version: version,
            revoked_version: None,
        };

        self.index_live_edge(&edge);
        self.edges.insert(edge.id, edge.clone());
        let entry = self.append(MutationPayload::Grant { edge: edge.clone() }, actor);
        GrantOutcome::Minted(edge, entry)
    }

    /// Revoke an edge by id
    pub fn revoke_by_id(
        &mut self,
        id: EdgeId,
        actor: Option<String>,
    ) -> Result<(EdgeRecord, MutationEntry), ServiceError> {
        let edge = self
            .edges
            .get(&id)
            .ok_or_else(|| ServiceError::unknown_edge(id))?;
        if !edge.is_live() {
            return Err(ServiceError::constraint(format!(
                "edge '{id}' is already revoked"
            )));
        }

        let version = self.current_version.next();
        let edge = {
            let edge = self
                .edges
                .get_mut(&id)
                .ok_or_else(|| ServiceError::unknown_edge(id))?;
            edge.revoked_version = Some(version);
            edge.clone()
        };
        self.unindex_live_edge(&edge);

        let entry = self.append(
            MutationPayload::Revoke {
                edge_id: edge.id,
                relation: edge.relation.clone(),
                source: edge.source.clone(),
                target: edge.target.clone(),
            },
            actor,
        );
        Ok((edge, entry))
    }

    /// Revoke the live edge matching a tuple
    pub fn revoke_by_tuple(
        &mut self,
        relation: &str,
        source: &str,
        target: &str,
        capability: Option<&Capability>,
        actor: Option<String>,
    ) -> Result<(EdgeRecord, MutationEntry), ServiceError> {
        let id = self
            .find_live_tuple(relation, source, target, capability)
            .ok_or_else(|| {
                ServiceError::unknown_edge(format!("{relation}:{source}->{target}"))
            })?;
        self.revoke_by_id(id, actor)
    }

    /// Record an entity upsert
    pub fn record_upsert(
        &mut self,
        entity: &str,
        row: serde_json::Map<String, serde_json::Value>,
        actor: Option<String>,
    ) -> MutationEntry {
        self.append(
            MutationPayload::UpsertEntity {
                entity: entity.to_string(),
                row,
            },
            actor,
        )
    }

    /// Record an entity delete, revoking the given cascade edges under the
    /// same version
    pub fn record_delete(
        &mut self,
        entity: &str,
        id: &str,
        cascade: &[EdgeId],
        actor: Option<String>,
    ) -> MutationEntry {
        let version = self.current_version.next();
        for edge_id in cascade {
            if let Some(edge) = self.edges.get_mut(edge_id) {
                if edge.is_live() {
                    edge.revoked_version = Some(version);
                    let edge = edge.clone();
                    self.unindex_live_edge(&edge);
                }
            }
        }
        self.append(
            MutationPayload::DeleteEntity {
                entity: entity.to_string(),
                id: id.to_string(),
                revoked_edges: cascade.to_vec(),
            },
            actor,
        )
    }

    /// Record a schema activation
    pub fn record_schema_change(
        &mut self,
        schema_version: u32,
        actor: Option<String>,
    ) -> MutationEntry {
        self.append(MutationPayload::SchemaChange { schema_version }, actor)
    }

    fn append(&mut self, payload: MutationPayload, actor: Option<String>) -> MutationEntry {
        self.current_version = self.current_version.next();
        let entry = MutationEntry::new(self.current_version, payload, actor);
        self.recent.push_back(entry.clone());
        while self.recent.len() > self.retention {
            self.recent.pop_front();
        }
        self.last_mutation_at = Some(Instant::now());
        entry
    }

    fn index_live_edge(&mut self, edge: &EdgeRecord) {
        self.live_tuples.insert(
            TupleKey {
                relation: edge.relation.clone(),
                source: edge.source.clone(),
                target: edge.target.clone(),
                capability: edge.capability.clone(),
            },
            edge.id,
        );
        self.live_by_node
            .entry(edge.source.clone())
            .or_default()
            .insert(edge.id);
        self.live_by_node
            .entry(edge.target.clone())
            .or_default()
            .insert(edge.id);
    }

    fn unindex_live_edge(&mut self, edge: &EdgeRecord) {
        self.live_tuples.remove(&TupleKey {
            relation: edge.relation.clone(),
            source: edge.source.clone(),
            target: edge.target.clone(),
            capability: edge.capability.clone(),
        });
        if let Some(ids) = self.live_by_node.get_mut(&edge.source) {
            ids.remove(&edge.id);
        }
        if let Some(ids) = self.live_by_node.get_mut(&edge.target) {
            ids.remove(&edge.id);
        }
    }

    // ---- Snapshots & recovery --------------------------------------------

    /// Record that a snapshot through `version` is durable
    pub fn mark_snapshot(&mut self, version: Version) {
        self.snapshot_version = version;
    }

    /// The highest version the durable log may prune through
    ///
    /// Keeps a window of `retention` entries before the snapshot so clients
    /// slightly behind it can still catch up without a full resync; nothing
    /// newer than the snapshot is ever prunable.
    pub fn prunable_through(&self) -> Option<Version> {
        let through = self.snapshot_version.0.checked_sub(self.retention as u64)?;
        (through > 0).then_some(Version(through))
    }

    /// Rebuild ledger maps from snapshot edges
    pub fn rebuild(&mut self, edges: Vec<EdgeRecord>, version: Version) {
        self.edges.clear();
        self.live_tuples.clear();
        self.live_by_node.clear();
        self.recent.clear();
        for edge in edges {
            if edge.is_live() {
                self.index_live_edge(&edge);
            }
            self.edges.insert(edge.id, edge);
        }
        self.current_version = version;
        self.snapshot_version = version;
    }

    /// Re-apply one logged entry during recovery
    ///
    /// Entries must arrive in order with no gaps; anything else halts
    /// recovery with `ReplayFailed`.
    pub fn replay(&mut self, entry: &MutationEntry) -> Result<(), ServiceError> {
        if entry.version != self.current_version.next() {
            return Err(ServiceError::ReplayFailed {
                version: entry.version,
                reason: format!(
                    "expected version {}, log has {}",
                    self.current_version.next(),
                    entry.version
                ),
            });
        }

        match &entry.payload {
            MutationPayload::Grant { edge } => {
                self.index_live_edge(edge);
                self.edges.insert(edge.id, edge.clone());
            }
            MutationPayload::Revoke { edge_id, .. } => {
                let Some(edge) = self.edges.get_mut(edge_id) else {
                    return Err(ServiceError::ReplayFailed {
                        version: entry.version,
                        reason: format!("revoke of unknown edge '{edge_id}'"),
                    });
                };
                edge.revoked_version = Some(entry.version);
                let edge = edge.clone();
                self.unindex_live_edge(&edge);
            }
            MutationPayload::DeleteEntity { revoked_edges, .. } => {
                for edge_id in revoked_edges {
                    if let Some(edge) = self.edges.get_mut(edge_id) {
                        edge.revoked_version = Some(entry.version);
                        let edge = edge.clone();
                        self.unindex_live_edge(&edge);
                    }
                }
            }
            MutationPayload::UpsertEntity { .. } | MutationPayload::SchemaChange { .. } => {}
        }

        self.current_version = entry.version;
        self.recent.push_back(entry.clone());
        while self.recent.len() > self.retention {
            self.recent.pop_front();
        }
        Ok(())
    }
}
