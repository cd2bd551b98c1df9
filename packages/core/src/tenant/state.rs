//! Per-Tenant State
//!
//! Everything one tenant owns, composed behind a single-writer commit path:
//! schema registry, tabular store, graph index, edge ledger, query cache,
//! and the sync hub. `apply` is the only way state changes; it validates
//! first, appends to the ledger second, and only then touches the derived
//! structures, so a rejected mutation leaves no trace.
//!
//! All methods here are synchronous and never suspend; asynchrony (locks,
//! durable log appends, snapshot writes) lives in the tenant handle.

use crate::config::CoreConfig;
use crate::db::snapshot::{Row, SnapshotData};
use crate::models::compiled::CompiledSchema;
use crate::models::edge::{Capability, EdgeId, EdgeRecord};
use crate::models::mutation::{
    MutationEntry, MutationOutcome, MutationPayload, MutationRequest, RevokeTarget, Version,
};
use crate::models::proof::{EdgePathProof, ProofRejection};
use crate::models::schema::SchemaDefinition;
use crate::services::edge_ledger::{EdgeLedger, GrantOutcome};
use crate::services::error::ServiceError;
use crate::services::graph_index::{AccessorEntry, GraphIndex};
use crate::services::query_cache::{CacheStats, CachedAnswer, QueryCache, QueryKey};
use crate::services::schema_registry::SchemaRegistry;
use crate::services::tabular_store::TabularStore;
use crate::services::validation::validate_proof;
use crate::sync::hub::SyncHub;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, instrument, warn};

/// Counters reported by `GET /{tenant}/stats`
#[derive(Debug, Clone, serde::Serialize)]
pub struct TenantStats {
    pub tenant: String,
    pub entities: usize,
    pub edges_live: usize,
    pub edges_total: usize,
    pub current_version: Version,
    pub snapshot_version: Version,
    pub schema_version: Option<u32>,
    pub connections: usize,
    pub degraded: bool,
    pub cache: CacheStats,
}

/// One tenant's complete in-memory state
pub struct TenantState {
    pub tenant_id: String,
    config: Arc<CoreConfig>,
    registry: SchemaRegistry,
    store: TabularStore,
    index: GraphIndex,
    ledger: EdgeLedger,
    cache: Mutex<QueryCache>,
    pub hub: SyncHub,
    degraded: bool,
    /// Entries committed in memory but not yet durable in the mutation log
    pub pending_log: Vec<MutationEntry>,
}

impl TenantState {
    /// Fresh tenant with the default schema installed
    pub fn new(tenant_id: &str, config: Arc<CoreConfig>) -> Result<Self, ServiceError> {
        let mut registry = SchemaRegistry::new();
        let schema = registry.install_default()?.clone();
        let mut store = TabularStore::new();
        store.apply_schema(&schema);

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            ledger: EdgeLedger::new(config.log_retention()),
            cache: Mutex::new(QueryCache::new(
                config.cache_capacity,
                config.cache_ttl,
                config.cache_enabled,
            )),
            hub: SyncHub::new(config.send_queue_capacity, config.max_catchup),
            registry,
            store,
            index: GraphIndex::new(),
            degraded: false,
            pending_log: Vec::new(),
            config,
        })
    }

    /// Rebuild a tenant from a loaded snapshot
    pub fn from_snapshot(
        tenant_id: &str,
        config: Arc<CoreConfig>,
        data: &SnapshotData,
    ) -> Result<Self, ServiceError> {
        let store = TabularStore::load(data)?;

        // Reconstruct every edge (tombstones included) from the
        // relationship tables
        let mut edges = Vec::new();
        for (name, table) in store.tables() {
            let relation_kind = match &table.definition.table_kind {
                crate::models::compiled::TableKind::Relationship { relation_kind, .. } => {
                    *relation_kind
                }
                crate::models::compiled::TableKind::Entity => continue,
            };
            for (_, row) in table.iter() {
                let Some(edge) = EdgeRecord::from_row(name, relation_kind, row) else {
                    return Err(ServiceError::ReplayFailed {
                        version: data.version,
                        reason: format!("malformed edge row in snapshot table '{name}'"),
                    });
                };
                edges.push(edge);
            }
        }

        let mut ledger = EdgeLedger::new(config.log_retention());
        ledger.rebuild(edges, data.version);

        let mut registry = SchemaRegistry::new();
        registry.restore(data.schema.clone());
        let index = GraphIndex::rebuild(&data.schema, ledger.iter_edges());

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            cache: Mutex::new(QueryCache::new(
                config.cache_capacity,
                config.cache_ttl,
                config.cache_enabled,
            )),
            hub: SyncHub::new(config.send_queue_capacity, config.max_catchup),
            registry,
            store,
            index,
            ledger,
            degraded: false,
            pending_log: Vec::new(),
            config,
        })
    }

    // ---- Accessors --------------------------------------------------------

    pub fn schema(&self) -> Result<&CompiledSchema, ServiceError> {
        self.registry.active()
    }

    pub fn current_version(&self) -> Version {
        self.ledger.current_version()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Demote the tenant to read-only after a recovery failure
    pub fn mark_degraded(&mut self, reason: &str) {
        warn!(tenant = %self.tenant_id, reason, "tenant demoted to read-only");
        self.degraded = true;
    }

    pub fn ledger(&self) -> &EdgeLedger {
        &self.ledger
    }

    pub fn registry_mut(&mut self) -> &mut SchemaRegistry {
        &mut self.registry
    }

    /// Rough resident size for the memory soft cap
    pub fn estimated_bytes(&self) -> usize {
        self.store.estimated_bytes() + self.ledger.edge_count() * 256
    }

    /// Whether the tenant is over its memory soft cap
    pub fn over_memory_cap(&self) -> bool {
        self.estimated_bytes() > self.config.memory_soft_cap
    }

    pub fn stats(&self) -> TenantStats {
        TenantStats {
            tenant: self.tenant_id.clone(),
            entities: self.store.entity_count(),
            edges_live: self.ledger.live_edge_count(),
            edges_total: self.ledger.edge_count(),
            current_version: self.ledger.current_version(),
            snapshot_version: self.ledger.snapshot_version(),
            schema_version: self.registry.active_version(),
            connections: self.hub.connection_count(),
            degraded: self.degraded,
            cache: self.cache_lock().stats(),
        }
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, QueryCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- Mutations --------------------------------------------------------

    /// Whether the snapshot policy wants a snapshot now
    pub fn should_snapshot(&self) -> bool {
        if self.ledger.mutations_since_snapshot() == 0 {
            return false;
        }
        if self.ledger.mutations_since_snapshot() >= self.config.snapshot_mutation_threshold {
            return true;
        }
        self.ledger
            .idle_for()
            .map(|idle| idle >= self.config.snapshot_idle)
            .unwrap_or(false)
    }

    /// The canonical snapshot projection of current state
    pub fn snapshot_data(&self) -> Result<SnapshotData, ServiceError> {
        let schema = self.registry.active()?;
        Ok(self.store.snapshot(self.ledger.current_version(), schema))
    }

    /// Record that a snapshot through `version` is durable
    pub fn mark_snapshot(&mut self, version: Version) {
        self.ledger.mark_snapshot(version);
    }

    /// Highest log version the durable log may prune
    pub fn prunable_through(&self) -> Option<Version> {
        self.ledger.prunable_through()
    }

    /// The single-writer commit path
    ///
    /// Validates, appends to the ledger, updates the store and index,
    /// invalidates the cache, and broadcasts. Returns the outcome and the
    /// committed entry (`None` for an idempotent repeat grant). The caller
    /// owns durable persistence of the entry.
    #[instrument(skip(self, request), fields(tenant = %self.tenant_id))]
    pub fn apply(
        &mut self,
        request: &MutationRequest,
        actor: Option<String>,
    ) -> Result<(MutationOutcome, Option<MutationEntry>), ServiceError> {
        if self.degraded {
            return Err(ServiceError::DegradedReadOnly {
                tenant: self.tenant_id.clone(),
            });
        }

        let (outcome, entry) = match request {
            MutationRequest::Grant {
                relation,
                source,
                target,
                properties,
            } => self.apply_grant(relation, source, target, properties.as_ref(), actor)?,
            MutationRequest::Revoke { target } => self.apply_revoke(target, actor)?,
            MutationRequest::UpsertEntity { entity, row } => {
                self.apply_upsert(entity, row, actor)?
            }
            MutationRequest::DeleteEntity { entity, id } => {
                self.apply_delete(entity, id, actor)?
            }
        };

        if let Some(entry) = &entry {
            self.hub.broadcast(entry);
        }
        Ok((outcome, entry))
    }

    fn apply_grant(
        &mut self,
        relation: &str,
        source: &str,
        target: &str,
        properties: Option<&Row>,
        actor: Option<String>,
    ) -> Result<(MutationOutcome, Option<MutationEntry>), ServiceError> {
        let schema = self.registry.active()?;
        let definition = schema
            .relation(relation)
            .ok_or_else(|| ServiceError::unknown_table(relation))?
            .clone();

        if !self.store.entity_exists(&definition.source, source) {
            return Err(ServiceError::unknown_entity(&definition.source, source));
        }
        if !self.store.entity_exists(&definition.target, target) {
            return Err(ServiceError::unknown_entity(&definition.target, target));
        }

        let properties = properties.cloned().unwrap_or_default();
        let capability = match properties.get("capability").and_then(|v| v.as_str()) {
            Some(name) => Some(Capability::from(name)),
            None if definition.is_permission() => {
                return Err(ServiceError::malformed(format!(
                    "grants of '{relation}' require a 'capability' property"
                )));
            }
            None => None,
        };

        // Validate the would-be row before anything commits; a probe with
        // placeholder bookkeeping values exercises exactly the declared
        // property columns
        let table = schema
            .table(relation)
            .ok_or_else(|| ServiceError::unknown_table(relation))?;
        let mut probe = properties.clone();
        probe.insert("source_id".to_string(), source.into());
        probe.insert("target_id".to_string(), target.into());
        probe.insert(
            "edge_id".to_string(),
            "00000000-0000-4000-8000-000000000000".into(),
        );
        probe.insert("created_version".to_string(), 0u64.into());
        table.normalize_row(&probe)?;

        match self.ledger.grant(
            relation,
            definition.kind,
            source,
            target,
            capability.clone(),
            properties,
            actor,
        ) {
            GrantOutcome::Existing(edge_id) => Ok((
                MutationOutcome {
                    version: self.ledger.current_version(),
                    edge_id: Some(edge_id),
                    idempotent: true,
                },
                None,
            )),
            GrantOutcome::Minted(edge, entry) => {
                let schema = self.registry.active()?.clone();
                self.store.insert(relation, &edge.to_row())?;
                self.index.apply_grant(&schema, &edge);
                self.cache_lock().invalidate_edge(
                    &edge.source,
                    &edge.target,
                    edge.capability.as_ref(),
                );
                info!(
                    tenant = %self.tenant_id,
                    edge = %edge.id,
                    relation,
                    version = %entry.version,
                    "edge granted"
                );
                Ok((
                    MutationOutcome {
                        version: entry.version,
                        edge_id: Some(edge.id),
                        idempotent: false,
                    },
                    Some(entry),
                ))
            }
        }
    }

    fn apply_revoke(
        &mut self,
        target: &RevokeTarget,
        actor: Option<String>,
    ) -> Result<(MutationOutcome, Option<MutationEntry>), ServiceError> {
        let (edge, entry) = match target {
            RevokeTarget::ById { edge_id } => self.ledger.revoke_by_id(*edge_id, actor)?,
            RevokeTarget::ByTuple {
                relation,
                source,
                target,
                capability,
            } => self.ledger.revoke_by_tuple(
                relation,
                source,
                target,
                capability.as_ref(),
                actor,
            )?,
        };

        let mut patch = Row::new();
        patch.insert(
            "revoked_version".to_string(),
            serde_json::Value::from(entry.version.0),
        );
        self.store
            .update(&edge.relation, &edge.id.to_string(), &patch)?;
        self.index.apply_revoke(&edge);
        self.cache_lock()
            .invalidate_edge(&edge.source, &edge.target, edge.capability.as_ref());

        info!(
            tenant = %self.tenant_id,
            edge = %edge.id,
            version = %entry.version,
            "edge revoked"
        );
        Ok((
            MutationOutcome {
                version: entry.version,
                edge_id: Some(edge.id),
                idempotent: false,
            },
            Some(entry),
        ))
    }

    fn apply_upsert(
        &mut self,
        entity: &str,
        row: &Row,
        actor: Option<String>,
    ) -> Result<(MutationOutcome, Option<MutationEntry>), ServiceError> {
        let schema = self.registry.active()?;
        let table = schema
            .table(entity)
            .ok_or_else(|| ServiceError::unknown_table(entity))?;
        if !table.is_entity() {
            return Err(ServiceError::malformed(format!(
                "'{entity}' is a relationship; entities cannot be upserted into it"
            )));
        }

        let normalized = self.store.insert(entity, row)?;
        let entry = self.ledger.record_upsert(entity, normalized, actor);
        Ok((
            MutationOutcome {
                version: entry.version,
                edge_id: None,
                idempotent: false,
            },
            Some(entry),
        ))
    }

    fn apply_delete(
        &mut self,
        entity: &str,
        id: &str,
        actor: Option<String>,
    ) -> Result<(MutationOutcome, Option<MutationEntry>), ServiceError> {
        if !self.store.entity_exists(entity, id) {
            return Err(ServiceError::unknown_entity(entity, id));
        }

        // Cascade policy: every live edge referencing the entity must belong
        // to a relationship that opted into cascade, otherwise the delete is
        // rejected outright
        let schema = self.registry.active()?;
        let touching = self.ledger.live_edges_touching(id);
        for edge in &touching {
            let cascades = schema
                .relation(&edge.relation)
                .map(|r| r.cascade_on_delete)
                .unwrap_or(false);
            if !cascades {
                return Err(ServiceError::constraint(format!(
                    "entity '{id}' is referenced by live '{}' edge {}",
                    edge.relation, edge.id
                )));
            }
        }

        let cascade_ids: Vec<EdgeId> = touching.iter().map(|e| e.id).collect();
        let entry = self
            .ledger
            .record_delete(entity, id, &cascade_ids, actor);

        for edge in &touching {
            let mut patch = Row::new();
            patch.insert(
                "revoked_version".to_string(),
                serde_json::Value::from(entry.version.0),
            );
            self.store
                .update(&edge.relation, &edge.id.to_string(), &patch)?;
            self.index.apply_revoke(edge);
            self.cache_lock()
                .invalidate_edge(&edge.source, &edge.target, edge.capability.as_ref());
        }
        self.store.delete(entity, id)?;

        info!(
            tenant = %self.tenant_id,
            entity,
            id,
            cascaded = cascade_ids.len(),
            version = %entry.version,
            "entity deleted"
        );
        Ok((
            MutationOutcome {
                version: entry.version,
                edge_id: None,
                idempotent: false,
            },
            Some(entry),
        ))
    }

    // ---- Schema operations ------------------------------------------------

    /// Validate and store a new schema version (does not activate)
    pub fn upload_schema(&mut self, source: SchemaDefinition) -> Result<u32, ServiceError> {
        self.registry.upload(source)
    }

    /// Activate (or roll back to) a stored schema version
    ///
    /// Emits the `schema_change` mutation and rebuilds the derived
    /// structures under the new compiled schema.
    pub fn activate_schema(
        &mut self,
        version: u32,
    ) -> Result<(u32, MutationEntry), ServiceError> {
        if self.degraded {
            return Err(ServiceError::DegradedReadOnly {
                tenant: self.tenant_id.clone(),
            });
        }
        if self.registry.active_version() == Some(version) {
            return Err(ServiceError::version_conflict(format!(
                "schema version {version} is already active"
            )));
        }

        // Only entries newer than the last durable snapshot can ever replay;
        // older history is already baked into the snapshot
        let retained = self
            .ledger
            .entries_after(self.ledger.snapshot_version())
            .unwrap_or_default();
        let schema = self
            .registry
            .activate(version, &self.store, &retained)?
            .clone();

        self.store.apply_schema(&schema);
        self.index = GraphIndex::rebuild(&schema, self.ledger.iter_edges());
        self.cache_lock().clear();

        let entry = self.ledger.record_schema_change(version, None);
        self.hub.broadcast(&entry);
        info!(tenant = %self.tenant_id, version, "schema change committed");
        Ok((version, entry))
    }

    // ---- Recovery ---------------------------------------------------------

    /// Re-apply one logged entry during cold-start recovery
    pub fn replay_entry(&mut self, entry: &MutationEntry) -> Result<(), ServiceError> {
        self.ledger.replay(entry)?;

        match &entry.payload {
            MutationPayload::Grant { edge } => {
                let schema = self.registry.active()?.clone();
                self.store.insert(&edge.relation, &edge.to_row())?;
                self.index.apply_grant(&schema, edge);
            }
            MutationPayload::Revoke { edge_id, .. } => {
                let edge = self
                    .ledger
                    .edge(*edge_id)
                    .ok_or_else(|| ServiceError::unknown_edge(edge_id))?
                    .clone();
                let mut patch = Row::new();
                patch.insert(
                    "revoked_version".to_string(),
                    serde_json::Value::from(entry.version.0),
                );
                self.store.update(&edge.relation, &edge.id.to_string(), &patch)?;
                self.index.apply_revoke(&edge);
            }
            MutationPayload::UpsertEntity { entity, row } => {
                self.store.insert(entity, row)?;
            }
            MutationPayload::DeleteEntity {
                entity,
                id,
                revoked_edges,
            } => {
                for edge_id in revoked_edges {
                    if let Some(edge) = self.ledger.edge(*edge_id).cloned() {
                        let mut patch = Row::new();
                        patch.insert(
                            "revoked_version".to_string(),
                            serde_json::Value::from(entry.version.0),
                        );
                        self.store
                            .update(&edge.relation, &edge.id.to_string(), &patch)?;
                        self.index.apply_revoke(&edge);
                    }
                }
                self.store.delete(entity, id)?;
            }
            MutationPayload::SchemaChange { schema_version } => {
                let schema = self.registry.activate_for_replay(*schema_version)?.clone();
                self.store.apply_schema(&schema);
                self.index = GraphIndex::rebuild(&schema, self.ledger.iter_edges());
            }
        }
        Ok(())
    }

    // ---- Queries ----------------------------------------------------------

    /// Boolean authorization query with a witness path
    pub fn can(
        &self,
        subject: &str,
        capability: &Capability,
        object: &str,
    ) -> (bool, Option<Vec<EdgeId>>) {
        let key = QueryKey::Can {
            subject: subject.to_string(),
            capability: capability.clone(),
            object: object.to_string(),
        };
        if let Some(CachedAnswer::Can(witness)) = self.cache_lock().get(&key) {
            return (witness.is_some(), witness);
        }

        let witness = self.index.can(
            subject,
            capability,
            object,
            self.config.max_traversal,
            |id| self.ledger.is_live(id),
        );
        self.cache_lock()
            .put(key, CachedAnswer::Can(witness.clone()));
        (witness.is_some(), witness)
    }

    /// All objects the subject can act on with the capability
    pub fn accessible_objects(&self, subject: &str, capability: &Capability) -> BTreeSet<String> {
        let key = QueryKey::Accessible {
            subject: subject.to_string(),
            capability: capability.clone(),
        };
        if let Some(CachedAnswer::Accessible(objects)) = self.cache_lock().get(&key) {
            return objects;
        }

        let objects = self.index.accessible_objects(
            subject,
            capability,
            self.config.max_traversal,
            |id| self.ledger.is_live(id),
        );
        self.cache_lock()
            .put(key, CachedAnswer::Accessible(objects.clone()));
        objects
    }

    /// All subjects with access to the object, with provenance
    pub fn accessors(&self, object: &str, capability: &Capability) -> Vec<AccessorEntry> {
        let key = QueryKey::Accessors {
            object: object.to_string(),
            capability: capability.clone(),
        };
        if let Some(CachedAnswer::Accessors(accessors)) = self.cache_lock().get(&key) {
            return accessors;
        }

        let accessors = self.index.accessors(
            object,
            capability,
            self.config.max_traversal,
            |id| self.ledger.is_live(id),
        );
        self.cache_lock()
            .put(key, CachedAnswer::Accessors(accessors.clone()));
        accessors
    }

    /// Validate a client-supplied edge-path proof
    pub fn check_proof(&self, proof: &EdgePathProof) -> Result<(), ProofRejection> {
        let schema = match self.registry.active() {
            Ok(schema) => schema,
            Err(_) => {
                return Err(ProofRejection::BrokenChain { at: 0 });
            }
        };
        validate_proof(schema, &self.ledger, proof, self.config.max_traversal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> TenantState {
        let state = TenantState::new("acme", Arc::new(CoreConfig::default())).unwrap();
        state
    }

    fn upsert(entity: &str, id: &str) -> MutationRequest {
        MutationRequest::UpsertEntity {
            entity: entity.to_string(),
            row: json!({ "id": id }).as_object().unwrap().clone(),
        }
    }

    fn grant(relation: &str, source: &str, target: &str, capability: Option<&str>) -> MutationRequest {
        let mut properties = serde_json::Map::new();
        if let Some(capability) = capability {
            properties.insert("capability".to_string(), capability.into());
        }
        MutationRequest::Grant {
            relation: relation.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            properties: (!properties.is_empty()).then_some(properties),
        }
    }

    fn seed_direct_permission(state: &mut TenantState) -> EdgeId {
        state.apply(&upsert("user", "user:alice"), None).unwrap();
        state.apply(&upsert("resource", "resource:doc1"), None).unwrap();
        let (outcome, _) = state
            .apply(
                &grant("has_permission", "user:alice", "resource:doc1", Some("read")),
                None,
            )
            .unwrap();
        outcome.edge_id.unwrap()
    }

    #[test]
    fn test_direct_permission_scenario() {
        let mut state = state();
        seed_direct_permission(&mut state);

        let (allowed, witness) = state.can("user:alice", &Capability::from("read"), "resource:doc1");
        assert!(allowed);
        assert_eq!(witness.unwrap().len(), 1);

        let (allowed, _) = state.can("user:bob", &Capability::from("read"), "resource:doc1");
        assert!(!allowed);
    }

    #[test]
    fn test_grant_requires_existing_endpoints() {
        let mut state = state();
        state.apply(&upsert("user", "user:alice"), None).unwrap();

        let err = state
            .apply(
                &grant("has_permission", "user:alice", "resource:ghost", Some("read")),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownEntity { .. }));

        // Nothing committed: version is still just the upsert
        assert_eq!(state.current_version(), Version(1));
    }

    #[test]
    fn test_grant_requires_capability_on_permission_edges() {
        let mut state = state();
        state.apply(&upsert("user", "user:alice"), None).unwrap();
        state.apply(&upsert("resource", "resource:doc1"), None).unwrap();

        let err = state
            .apply(
                &grant("has_permission", "user:alice", "resource:doc1", None),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::MalformedRequest(_)));
    }

    #[test]
    fn test_idempotent_grant() {
        let mut state = state();
        let edge_id = seed_direct_permission(&mut state);
        let version = state.current_version();

        let (outcome, entry) = state
            .apply(
                &grant("has_permission", "user:alice", "resource:doc1", Some("read")),
                None,
            )
            .unwrap();
        assert!(outcome.idempotent);
        assert_eq!(outcome.edge_id, Some(edge_id));
        assert_eq!(outcome.version, version);
        assert!(entry.is_none());
        assert_eq!(state.current_version(), version);
    }

    #[test]
    fn test_revoke_restores_pre_grant_answer() {
        let mut state = state();
        let edge_id = seed_direct_permission(&mut state);

        let (outcome, _) = state
            .apply(
                &MutationRequest::Revoke {
                    target: RevokeTarget::ById { edge_id },
                },
                None,
            )
            .unwrap();
        assert!(!outcome.idempotent);

        let (allowed, _) = state.can("user:alice", &Capability::from("read"), "resource:doc1");
        assert!(!allowed);

        // The tombstone row remains in the relationship table
        let row = state
            .store
            .get("has_permission", &edge_id.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(row["revoked_version"], json!(outcome.version.0));
    }

    #[test]
    fn test_delete_rejected_while_referenced() {
        let mut state = state();
        state.apply(&upsert("user", "user:alice"), None).unwrap();
        state.apply(&upsert("group", "group:eng"), None).unwrap();
        state
            .apply(&grant("member_of", "user:alice", "group:eng", None), None)
            .unwrap();

        // member_of does not cascade in the default schema
        let err = state
            .apply(
                &MutationRequest::DeleteEntity {
                    entity: "group".to_string(),
                    id: "group:eng".to_string(),
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::ConstraintViolated { .. }));
    }

    #[test]
    fn test_delete_cascades_permission_edges() {
        let mut state = state();
        let edge_id = seed_direct_permission(&mut state);

        let (outcome, entry) = state
            .apply(
                &MutationRequest::DeleteEntity {
                    entity: "resource".to_string(),
                    id: "resource:doc1".to_string(),
                },
                None,
            )
            .unwrap();

        // has_permission cascades in the default schema
        match &entry.unwrap().payload {
            MutationPayload::DeleteEntity { revoked_edges, .. } => {
                assert_eq!(revoked_edges, &vec![edge_id]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(!state.ledger().is_live(edge_id));
        assert!(!state.store.entity_exists("resource", "resource:doc1"));
        let _ = outcome;
    }

    #[test]
    fn test_degraded_tenant_rejects_writes_but_answers_reads() {
        let mut state = state();
        seed_direct_permission(&mut state);
        state.mark_degraded("test");

        let err = state.apply(&upsert("user", "user:bob"), None).unwrap_err();
        assert!(matches!(err, ServiceError::DegradedReadOnly { .. }));

        let (allowed, _) = state.can("user:alice", &Capability::from("read"), "resource:doc1");
        assert!(allowed);
    }

    #[test]
    fn test_schema_activation_enables_new_relationship() {
        let mut state = state();
        state.apply(&upsert("user", "user:alice"), None).unwrap();
        state.apply(&upsert("user", "user:bob"), None).unwrap();

        // Scenario 7: a grant citing an undeclared relationship is rejected
        let err = state
            .apply(&grant("supervises", "user:alice", "user:bob", None), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownTable { .. }));

        let mut source = crate::models::schema::default_schema();
        source.relationships.insert(
            "supervises".to_string(),
            crate::models::schema::RelationshipDefinition {
                source: "user".to_string(),
                target: "user".to_string(),
                kind: crate::models::schema::RelationKind::Plain,
                propagates: false,
                cascade_on_delete: false,
                properties: indexmap::IndexMap::new(),
                description: None,
            },
        );
        let version = state.upload_schema(source).unwrap();
        let (activated, entry) = state.activate_schema(version).unwrap();
        assert_eq!(activated, 2);
        assert!(matches!(
            entry.payload,
            MutationPayload::SchemaChange { schema_version: 2 }
        ));

        // After activation the same grant succeeds
        state
            .apply(&grant("supervises", "user:alice", "user:bob", None), None)
            .unwrap();
    }

    #[test]
    fn test_activating_active_version_conflicts() {
        let mut state = state();
        let err = state.activate_schema(1).unwrap_err();
        assert!(matches!(err, ServiceError::VersionConflict { .. }));
    }

    #[test]
    fn test_group_scenario_with_proof() {
        let mut state = state();
        state.apply(&upsert("user", "user:alice"), None).unwrap();
        state.apply(&upsert("group", "group:eng"), None).unwrap();
        state.apply(&upsert("resource", "resource:doc2"), None).unwrap();
        state
            .apply(&grant("member_of", "user:alice", "group:eng", None), None)
            .unwrap();
        state
            .apply(
                &grant("group_permission", "group:eng", "resource:doc2", Some("write")),
                None,
            )
            .unwrap();

        let (allowed, witness) =
            state.can("user:alice", &Capability::from("write"), "resource:doc2");
        assert!(allowed);
        let witness = witness.unwrap();
        assert_eq!(witness.len(), 2);

        // The witness is an acceptable proof (P3, one direction)
        let proof = EdgePathProof {
            subject: "user:alice".to_string(),
            object: "resource:doc2".to_string(),
            capability: Capability::from("write"),
            edge_ids: witness.iter().map(|id| id.to_string()).collect(),
            at_version: None,
        };
        assert!(state.check_proof(&proof).is_ok());
    }
}
