//! Tenant Handle
//!
//! The async face of one tenant actor. All mutations serialize through the
//! write half of a single `RwLock`; reads (queries, proof validation, stats)
//! run concurrently on the read half against a consistent snapshot of the
//! writer's state and never interleave mid-write.
//!
//! The handle owns everything that may suspend: lock acquisition, durable
//! log appends (with back-off and the write-suspension latch), snapshot
//! writes, and read deadlines. The state underneath never awaits.

use crate::config::CoreConfig;
use crate::db::{self, MutationLog, ObjectStore};
use crate::models::edge::Capability;
use crate::models::mutation::{MutationEntry, MutationOutcome, MutationRequest, Version};
use crate::models::proof::{EdgePathProof, ProofRejection};
use crate::models::schema::SchemaDefinition;
use crate::services::error::ServiceError;
use crate::services::graph_index::AccessorEntry;
use crate::sync::frames::ServerFrame;
use crate::sync::hub::{CloseReason, ConnectionId, HandshakeOutcome};
use crate::tenant::state::{TenantState, TenantStats};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, instrument, warn};

/// Attempts before a failing log append latches write suspension
const LOG_APPEND_ATTEMPTS: u32 = 5;

/// Base delay of the append back-off schedule
const LOG_APPEND_BACKOFF: Duration = Duration::from_millis(100);

/// One resident tenant actor
pub struct TenantHandle {
    pub tenant_id: String,
    state: RwLock<TenantState>,
    object_store: Arc<dyn ObjectStore>,
    log: Arc<dyn MutationLog>,
    config: Arc<CoreConfig>,
    /// Latched when the durable log keeps failing; new writes are refused
    /// until the pending entries drain
    writes_suspended: AtomicBool,
    /// Last request touching this tenant, for idle eviction
    last_touched: std::sync::Mutex<std::time::Instant>,
}

impl TenantHandle {
    /// Cold-start a tenant: load its snapshot and replay the log suffix
    ///
    /// A brand-new tenant starts fresh with the default schema. A replay
    /// failure does not abort the open; the tenant comes up demoted to
    /// `DegradedReadOnly` so reads still work.
    #[instrument(skip(object_store, log, config))]
    pub async fn open(
        tenant_id: &str,
        object_store: Arc<dyn ObjectStore>,
        log: Arc<dyn MutationLog>,
        config: Arc<CoreConfig>,
    ) -> Result<Arc<Self>, ServiceError> {
        let state = match db::load_snapshot(object_store.as_ref(), tenant_id).await? {
            None => {
                info!(tenant = tenant_id, "no snapshot; starting fresh tenant");
                TenantState::new(tenant_id, config.clone())?
            }
            Some(snapshot) => {
                let mut state = TenantState::from_snapshot(tenant_id, config.clone(), &snapshot)?;
                Self::restore_schema_versions(&object_store, tenant_id, &mut state).await?;

                let snapshot_version = snapshot.version;
                let latest = log.latest(tenant_id).await?.unwrap_or(snapshot_version);
                let entries = log.range(tenant_id, snapshot_version, latest).await?;
                info!(
                    tenant = tenant_id,
                    snapshot = %snapshot_version,
                    replaying = entries.len(),
                    "recovering tenant"
                );
                for entry in &entries {
                    if let Err(e) = state.replay_entry(entry) {
                        error!(
                            tenant = tenant_id,
                            version = %entry.version,
                            "replay failed: {e}; tenant is read-only"
                        );
                        state.mark_degraded("log replay failed");
                        break;
                    }
                }
                state
            }
        };

        Ok(Arc::new(Self {
            tenant_id: tenant_id.to_string(),
            state: RwLock::new(state),
            object_store,
            log,
            config,
            writes_suspended: AtomicBool::new(false),
            last_touched: std::sync::Mutex::new(std::time::Instant::now()),
        }))
    }

    /// Load every stored schema version document so logged schema changes
    /// can be replayed
    async fn restore_schema_versions(
        object_store: &Arc<dyn ObjectStore>,
        tenant_id: &str,
        state: &mut TenantState,
    ) -> Result<(), ServiceError> {
        let prefix = format!("{tenant_id}/schema/versions/");
        for key in object_store.list(&prefix).await? {
            let Some(bytes) = object_store.get(&key).await? else {
                continue;
            };
            let source: SchemaDefinition = serde_json::from_slice(&bytes)?;
            let Some(version) = source.version else {
                warn!(tenant = tenant_id, key, "stored schema version lacks a number");
                continue;
            };
            state.registry_mut().restore_version(version, source);
        }
        Ok(())
    }

    fn touch(&self) {
        let mut last = self
            .last_touched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = std::time::Instant::now();
    }

    /// Time since the last request touching this tenant
    pub fn idle_for(&self) -> Duration {
        self.last_touched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    // ---- Writes -----------------------------------------------------------

    /// Commit one mutation
    ///
    /// Once the writer accepts the mutation it runs to completion: the
    /// in-memory commit, the durable log append (with back-off), the
    /// broadcast, and any snapshot the policy asks for all happen while the
    /// write half of the lock is held, so every connection observes commits
    /// in version order.
    pub async fn apply(
        &self,
        request: &MutationRequest,
        actor: Option<String>,
    ) -> Result<MutationOutcome, ServiceError> {
        self.touch();
        let mut state = self.state.write().await;

        if self.writes_suspended.load(Ordering::Acquire) {
            self.drain_pending(&mut state).await?;
        }

        let (outcome, entry) = state.apply(request, actor)?;
        if let Some(entry) = entry {
            self.persist_entry(&mut state, entry).await;
        }

        if state.should_snapshot() {
            if let Err(e) = self.write_snapshot(&mut state).await {
                warn!(tenant = %self.tenant_id, "snapshot deferred: {e}");
            }
        }

        Ok(outcome)
    }

    /// Append one committed entry to the durable log, retrying with
    /// exponential back-off
    ///
    /// The in-memory commit already happened, so failure never rolls back;
    /// it queues the entry and latches write suspension until the log
    /// recovers.
    async fn persist_entry(&self, state: &mut TenantState, entry: MutationEntry) {
        let mut delay = LOG_APPEND_BACKOFF;
        for attempt in 1..=LOG_APPEND_ATTEMPTS {
            match self.log.append(&self.tenant_id, &entry).await {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempt < LOG_APPEND_ATTEMPTS => {
                    warn!(
                        tenant = %self.tenant_id,
                        version = %entry.version,
                        attempt,
                        "log append failed, backing off: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(
                        tenant = %self.tenant_id,
                        version = %entry.version,
                        "log append failing persistently: {e}; suspending writes"
                    );
                    state.pending_log.push(entry);
                    self.writes_suspended.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }

    /// Try to drain entries the log refused earlier; clears the suspension
    /// latch on success
    async fn drain_pending(&self, state: &mut TenantState) -> Result<(), ServiceError> {
        while let Some(entry) = state.pending_log.first().cloned() {
            match self.log.append(&self.tenant_id, &entry).await {
                Ok(()) => {
                    state.pending_log.remove(0);
                }
                Err(e) => {
                    return Err(ServiceError::Storage(e));
                }
            }
        }
        self.writes_suspended.store(false, Ordering::Release);
        info!(tenant = %self.tenant_id, "durable log recovered; writes resumed");
        Ok(())
    }

    /// Write a snapshot and prune the durable log behind it
    async fn write_snapshot(&self, state: &mut TenantState) -> Result<(), ServiceError> {
        let data = state.snapshot_data()?;
        let version = data.version;
        match db::write_snapshot(self.object_store.as_ref(), &self.tenant_id, &data).await {
            Ok(_) => {
                state.mark_snapshot(version);
                if let Some(through) = state.prunable_through() {
                    let pruned = self.log.prune_through(&self.tenant_id, through).await?;
                    if pruned > 0 {
                        info!(
                            tenant = %self.tenant_id,
                            through = %through,
                            pruned,
                            "mutation log pruned"
                        );
                    }
                }
                Ok(())
            }
            Err(crate::db::StorageError::PreconditionFailed { .. }) => {
                // Another writer owns this tenant now; serving anything
                // further would fork history
                state.mark_degraded("snapshot precondition failed (split brain)");
                Err(ServiceError::SnapshotStale)
            }
            Err(e) => Err(ServiceError::Storage(e)),
        }
    }

    /// Force a snapshot now (administrative request)
    pub async fn flush_snapshot(&self) -> Result<Version, ServiceError> {
        self.touch();
        let mut state = self.state.write().await;
        let version = state.current_version();
        self.write_snapshot(&mut state).await?;
        Ok(version)
    }

    // ---- Schema operations ------------------------------------------------

    /// Upload a schema version and persist its document
    pub async fn upload_schema(&self, source: SchemaDefinition) -> Result<u32, ServiceError> {
        self.touch();
        let mut state = self.state.write().await;
        let version = state.upload_schema(source.clone())?;

        let mut stored = source;
        stored.version = Some(version);
        let key = db::keys::schema_version(&self.tenant_id, version);
        self.object_store
            .put(&key, serde_json::to_vec_pretty(&stored)?)
            .await?;
        Ok(version)
    }

    /// Activate (or roll back to) a stored schema version
    pub async fn activate_schema(&self, version: u32) -> Result<u32, ServiceError> {
        self.touch();
        let mut state = self.state.write().await;
        let (activated, entry) = state.activate_schema(version)?;
        self.persist_entry(&mut state, entry).await;

        // Persist the new active schema eagerly; a crash before the next
        // snapshot must still recover under the right schema
        if let Err(e) = self.write_snapshot(&mut state).await {
            warn!(tenant = %self.tenant_id, "post-activation snapshot deferred: {e}");
        }
        Ok(activated)
    }

    /// The active compiled schema, serialized for `GET /{tenant}/schema`
    pub async fn schema_json(&self) -> Result<serde_json::Value, ServiceError> {
        self.touch();
        let state = self.state.read().await;
        Ok(serde_json::to_value(state.schema()?)?)
    }

    // ---- Reads ------------------------------------------------------------

    /// Run a read against a consistent view of the state, bounded by a
    /// deadline; a timed-out read leaves no partial state behind
    async fn read<T, F>(&self, operation: &str, deadline: Duration, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&TenantState) -> T,
    {
        self.touch();
        let read = async {
            let state = self.state.read().await;
            f(&state)
        };
        tokio::time::timeout(deadline, read)
            .await
            .map_err(|_| ServiceError::timeout(operation))
    }

    /// `can(subject, capability, object)` with its witness path
    pub async fn can(
        &self,
        subject: &str,
        capability: &Capability,
        object: &str,
    ) -> Result<(bool, Option<Vec<crate::models::edge::EdgeId>>), ServiceError> {
        self.read("can", self.config.query_timeout, |state| {
            state.can(subject, capability, object)
        })
        .await
    }

    /// All objects the subject can act on
    pub async fn accessible_objects(
        &self,
        subject: &str,
        capability: &Capability,
    ) -> Result<BTreeSet<String>, ServiceError> {
        self.read("accessible", self.config.query_timeout, |state| {
            state.accessible_objects(subject, capability)
        })
        .await
    }

    /// All subjects with access to the object
    pub async fn accessors(
        &self,
        object: &str,
        capability: &Capability,
    ) -> Result<Vec<AccessorEntry>, ServiceError> {
        self.read("accessors", self.config.query_timeout, |state| {
            state.accessors(object, capability)
        })
        .await
    }

    /// Validate an edge-path proof
    pub async fn check_proof(
        &self,
        proof: &EdgePathProof,
    ) -> Result<Result<(), ProofRejection>, ServiceError> {
        self.read("validate", self.config.proof_timeout, |state| {
            state.check_proof(proof)
        })
        .await
    }

    /// Tenant counters
    pub async fn stats(&self) -> TenantStats {
        self.touch();
        let state = self.state.read().await;
        state.stats()
    }

    // ---- WebSocket plumbing ----------------------------------------------

    /// Register a freshly upgraded connection
    ///
    /// Refused while the tenant is over its memory soft cap; queries still
    /// work in that state, but fan-out stops growing.
    pub async fn connect(
        &self,
    ) -> Result<(ConnectionId, mpsc::Receiver<ServerFrame>), ServiceError> {
        self.touch();
        let mut state = self.state.write().await;
        if state.over_memory_cap() {
            return Err(ServiceError::OverQuota {
                tenant: self.tenant_id.clone(),
            });
        }
        Ok(state.hub.register())
    }

    /// Handle a client's `version` frame
    pub async fn handshake(
        &self,
        id: ConnectionId,
        client_version: Version,
    ) -> HandshakeOutcome {
        self.touch();
        let mut state = self.state.write().await;
        let current = state.current_version();
        let entries = state.ledger().entries_after(client_version);
        state.hub.handle_version(id, client_version, current, entries)
    }

    /// Handle a client `ping`
    pub async fn client_ping(&self, id: ConnectionId) {
        let mut state = self.state.write().await;
        state.hub.touch(id);
        state.hub.send_to(id, ServerFrame::Pong);
    }

    /// Handle an optimistic client mutation; always answers with exactly one
    /// `ack` or `reject` carrying the client-local id
    pub async fn client_mutate(&self, id: ConnectionId, op: MutationRequest, client_id: String) {
        {
            let mut state = self.state.write().await;
            state.hub.touch(id);
        }
        match self.apply(&op, None).await {
            Ok(outcome) => {
                let mut state = self.state.write().await;
                state.hub.send_to(
                    id,
                    ServerFrame::Ack {
                        client_id,
                        version: outcome.version,
                    },
                );
            }
            Err(e) => {
                let mut state = self.state.write().await;
                state.hub.send_to(
                    id,
                    ServerFrame::Reject {
                        client_id,
                        reason: e.category().to_string(),
                    },
                );
            }
        }
    }

    /// Drop a connection
    pub async fn disconnect(&self, id: ConnectionId, reason: CloseReason) {
        let mut state = self.state.write().await;
        state.hub.close(id, reason);
    }

    /// Periodic housekeeping: idle connection sweep and idle snapshots
    pub async fn maintenance(&self) {
        let mut state = self.state.write().await;
        let evicted = state.hub.sweep_idle(self.config.connection_idle);
        if evicted > 0 {
            info!(tenant = %self.tenant_id, evicted, "idle connections evicted");
        }
        if state.should_snapshot() {
            if let Err(e) = self.write_snapshot(&mut state).await {
                warn!(tenant = %self.tenant_id, "idle snapshot deferred: {e}");
            }
        }
    }

    /// Live connection count (for eviction decisions)
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.hub.connection_count()
    }

    /// Drain the tenant before eviction or shutdown: close every connection
    /// and flush a final snapshot
    pub async fn drain(&self) {
        let mut state = self.state.write().await;
        state.hub.close_all();
        if state.ledger().mutations_since_snapshot() > 0 {
            if let Err(e) = self.write_snapshot(&mut state).await {
                warn!(tenant = %self.tenant_id, "final snapshot failed: {e}");
            }
        }
    }

    /// Run a closure against the read state (test and server helper)
    pub async fn with_state<T>(&self, f: impl FnOnce(&TenantState) -> T) -> T {
        let state = self.state.read().await;
        f(&state)
    }
}

impl std::fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantHandle")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}
