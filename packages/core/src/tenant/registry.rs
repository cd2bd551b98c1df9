//! Tenant Registry
//!
//! The only process-wide state: tenant id -> actor handle. Actors are
//! created lazily on first request (cold start loads the snapshot and
//! replays the log) and evicted after a configurable idle period, having
//! first drained their connections and flushed a final snapshot.

use crate::config::CoreConfig;
use crate::db::{MutationLog, ObjectStore};
use crate::services::error::ServiceError;
use crate::tenant::actor::TenantHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, instrument};

/// How often the maintenance loop runs
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide registry of resident tenant actors
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, Arc<TenantHandle>>>,
    object_store: Arc<dyn ObjectStore>,
    log: Arc<dyn MutationLog>,
    config: Arc<CoreConfig>,
}

/// A tenant id must be usable as an object-storage key segment
fn valid_tenant_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl TenantRegistry {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        log: Arc<dyn MutationLog>,
        config: Arc<CoreConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tenants: RwLock::new(HashMap::new()),
            object_store,
            log,
            config,
        })
    }

    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    /// Get the actor for a tenant, cold-starting it on first touch
    #[instrument(skip(self))]
    pub async fn tenant(&self, tenant_id: &str) -> Result<Arc<TenantHandle>, ServiceError> {
        if !valid_tenant_id(tenant_id) {
            return Err(ServiceError::unknown_tenant(tenant_id));
        }

        {
            let tenants = self.tenants.read().await;
            if let Some(handle) = tenants.get(tenant_id) {
                return Ok(handle.clone());
            }
        }

        let mut tenants = self.tenants.write().await;
        // Double-checked: another request may have opened it while we
        // waited for the write lock
        if let Some(handle) = tenants.get(tenant_id) {
            return Ok(handle.clone());
        }

        let handle = TenantHandle::open(
            tenant_id,
            self.object_store.clone(),
            self.log.clone(),
            self.config.clone(),
        )
        .await?;
        tenants.insert(tenant_id.to_string(), handle.clone());
        info!(tenant = tenant_id, resident = tenants.len(), "tenant actor started");
        Ok(handle)
    }

    /// Resident tenant count
    pub async fn resident_count(&self) -> usize {
        self.tenants.read().await.len()
    }

    /// One maintenance pass: per-tenant housekeeping, then idle eviction
    pub async fn maintenance_sweep(&self) {
        let handles: Vec<Arc<TenantHandle>> = {
            let tenants = self.tenants.read().await;
            tenants.values().cloned().collect()
        };

        let mut evict = Vec::new();
        for handle in handles {
            handle.maintenance().await;
            if handle.idle_for() > self.config.tenant_idle
                && handle.connection_count().await == 0
            {
                evict.push(handle.tenant_id.clone());
            }
        }

        if evict.is_empty() {
            return;
        }
        let mut tenants = self.tenants.write().await;
        for tenant_id in evict {
            if let Some(handle) = tenants.remove(&tenant_id) {
                handle.drain().await;
                info!(tenant = %tenant_id, "idle tenant evicted");
            }
        }
    }

    /// Spawn the background maintenance loop
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.maintenance_sweep().await;
            }
        })
    }

    /// Drain every resident tenant (server shutdown)
    pub async fn shutdown(&self) {
        let mut tenants = self.tenants.write().await;
        for (tenant_id, handle) in tenants.drain() {
            handle.drain().await;
            info!(tenant = %tenant_id, "tenant drained for shutdown");
        }
    }
}
