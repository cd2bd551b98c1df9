//! Durable Mutation Log
//!
//! Every committed mutation is mirrored to a bounded key-value log keyed by
//! `{tenant}:mutations:{version}`. The log is what makes catch-up sync and
//! crash recovery possible: a reconnecting client replays entries after its
//! last-seen version, and a cold-starting tenant replays entries after its
//! snapshot version.
//!
//! # Retention
//!
//! Entries are pruned only once a strictly newer snapshot is durable, and
//! even then a window of `MAX_CATCHUP + 100` entries before the snapshot is
//! kept so that clients slightly behind the snapshot can still catch up
//! without a full resync.

use crate::db::error::StorageError;
use crate::models::mutation::{MutationEntry, Version};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Key for one log entry, `{tenant}:mutations:{version}`
pub fn entry_key(tenant: &str, version: Version) -> String {
    format!("{tenant}:mutations:{version}")
}

/// Bounded per-tenant key-value mutation log
#[async_trait]
pub trait MutationLog: Send + Sync {
    /// Append one entry; appending an already-present version overwrites it
    /// (appends are idempotent retries, never divergent content)
    async fn append(&self, tenant: &str, entry: &MutationEntry) -> Result<(), StorageError>;

    /// Entries with versions in `(after, through]`, in version order
    async fn range(
        &self,
        tenant: &str,
        after: Version,
        through: Version,
    ) -> Result<Vec<MutationEntry>, StorageError>;

    /// The oldest retained version, or `None` when the log is empty
    async fn oldest(&self, tenant: &str) -> Result<Option<Version>, StorageError>;

    /// The newest retained version, or `None` when the log is empty
    async fn latest(&self, tenant: &str) -> Result<Option<Version>, StorageError>;

    /// Drop all entries with versions `<= through`; returns how many
    async fn prune_through(&self, tenant: &str, through: Version)
        -> Result<usize, StorageError>;
}

/// In-memory mutation log for tests and single-process deployments
#[derive(Default)]
pub struct MemoryMutationLog {
    entries: RwLock<HashMap<String, BTreeMap<u64, MutationEntry>>>,
}

impl MemoryMutationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MutationLog for MemoryMutationLog {
    async fn append(&self, tenant: &str, entry: &MutationEntry) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(tenant.to_string())
            .or_default()
            .insert(entry.version.0, entry.clone());
        Ok(())
    }

    async fn range(
        &self,
        tenant: &str,
        after: Version,
        through: Version,
    ) -> Result<Vec<MutationEntry>, StorageError> {
        let entries = self.entries.read().await;
        let Some(log) = entries.get(tenant) else {
            return Ok(Vec::new());
        };
        Ok(log
            .range(after.0 + 1..=through.0)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn oldest(&self, tenant: &str) -> Result<Option<Version>, StorageError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(tenant)
            .and_then(|log| log.keys().next().copied())
            .map(Version))
    }

    async fn latest(&self, tenant: &str) -> Result<Option<Version>, StorageError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(tenant)
            .and_then(|log| log.keys().next_back().copied())
            .map(Version))
    }

    async fn prune_through(
        &self,
        tenant: &str,
        through: Version,
    ) -> Result<usize, StorageError> {
        let mut entries = self.entries.write().await;
        let Some(log) = entries.get_mut(tenant) else {
            return Ok(0);
        };
        let keep = log.split_off(&through.0.saturating_add(1));
        let pruned = log.len();
        *log = keep;
        Ok(pruned)
    }
}

/// Mutation log persisted through an [`crate::db::ObjectStore`]
///
/// Stores one JSON object per entry under the `{tenant}:mutations:{version}`
/// key layout. Range scans list the tenant's prefix; versions are recovered
/// from the key suffix, so a corrupt object is detected at parse time.
pub struct KvMutationLog<S> {
    store: S,
}

impl<S: crate::db::ObjectStore> KvMutationLog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn prefix(tenant: &str) -> String {
        format!("{tenant}:mutations:")
    }

    async fn versions(&self, tenant: &str) -> Result<Vec<u64>, StorageError> {
        let prefix = Self::prefix(tenant);
        let keys = self.store.list(&prefix).await?;
        let mut versions = Vec::with_capacity(keys.len());
        for key in keys {
            let suffix = &key[prefix.len()..];
            let version: u64 = suffix.parse().map_err(|_| {
                StorageError::unavailable(format!("malformed log key '{key}'"))
            })?;
            versions.push(version);
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

#[async_trait]
impl<S: crate::db::ObjectStore> MutationLog for KvMutationLog<S> {
    async fn append(&self, tenant: &str, entry: &MutationEntry) -> Result<(), StorageError> {
        let key = entry_key(tenant, entry.version);
        let bytes = serde_json::to_vec(entry)?;
        self.store.put(&key, bytes).await
    }

    async fn range(
        &self,
        tenant: &str,
        after: Version,
        through: Version,
    ) -> Result<Vec<MutationEntry>, StorageError> {
        let mut result = Vec::new();
        for version in self.versions(tenant).await? {
            if version <= after.0 || version > through.0 {
                continue;
            }
            let key = entry_key(tenant, Version(version));
            let bytes = self
                .store
                .get(&key)
                .await?
                .ok_or_else(|| StorageError::not_found(&key))?;
            result.push(serde_json::from_slice(&bytes)?);
        }
        Ok(result)
    }

    async fn oldest(&self, tenant: &str) -> Result<Option<Version>, StorageError> {
        Ok(self.versions(tenant).await?.first().copied().map(Version))
    }

    async fn latest(&self, tenant: &str) -> Result<Option<Version>, StorageError> {
        Ok(self.versions(tenant).await?.last().copied().map(Version))
    }

    async fn prune_through(
        &self,
        tenant: &str,
        through: Version,
    ) -> Result<usize, StorageError> {
        let mut pruned = 0;
        for version in self.versions(tenant).await? {
            if version > through.0 {
                break;
            }
            self.store
                .delete(&entry_key(tenant, Version(version)))
                .await?;
            pruned += 1;
        }
        Ok(pruned)
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

    #[tokio::test]
    async fn test_memory_log_range_is_half_open() {
        let log = MemoryMutationLog::new();
        for v in 1..=5 {
            log.append("acme", &entry(v)).await.unwrap();
        }

        let range = log.range("acme", Version(2), Version(4)).await.unwrap();
        let versions: Vec<u64> = range.iter().map(|e| e.version.0).collect();
        assert_eq!(versions, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_memory_log_bounds() {
        let log = MemoryMutationLog::new();
        assert!(log.oldest("acme").await.unwrap().is_none());

        for v in 3..=7 {
            log.append("acme", &entry(v)).await.unwrap();
        }
        assert_eq!(log.oldest("acme").await.unwrap(), Some(Version(3)));
        assert_eq!(log.latest("acme").await.unwrap(), Some(Version(7)));
    }

    #[tokio::test]
    async fn test_memory_log_prune() {
        let log = MemoryMutationLog::new();
        for v in 1..=10 {
            log.append("acme", &entry(v)).await.unwrap();
        }

        let pruned = log.prune_through("acme", Version(6)).await.unwrap();
        assert_eq!(pruned, 6);
        assert_eq!(log.oldest("acme").await.unwrap(), Some(Version(7)));

        // Other tenants are untouched
        log.append("globex", &entry(1)).await.unwrap();
        assert_eq!(log.prune_through("acme", Version(100)).await.unwrap(), 4);
        assert_eq!(log.oldest("globex").await.unwrap(), Some(Version(1)));
    }

    #[tokio::test]
    async fn test_kv_log_round_trip() {
        let log = KvMutationLog::new(crate::db::MemoryObjectStore::new());
        for v in 1..=4 {
            log.append("acme", &entry(v)).await.unwrap();
        }

        let range = log.range("acme", Version(0), Version(4)).await.unwrap();
        assert_eq!(range.len(), 4);
        assert_eq!(range[0].version, Version(1));

        assert_eq!(log.prune_through("acme", Version(2)).await.unwrap(), 2);
        assert_eq!(log.oldest("acme").await.unwrap(), Some(Version(3)));
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let log = MemoryMutationLog::new();
        log.append("acme", &entry(1)).await.unwrap();
        log.append("acme", &entry(1)).await.unwrap();

        let range = log.range("acme", Version(0), Version(10)).await.unwrap();
        assert_eq!(range.len(), 1);
    }
}
