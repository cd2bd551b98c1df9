//! Object Storage Abstraction
//!
//! Durable state lives as objects under per-tenant keys: CSV snapshot tables,
//! the snapshot manifest, and schema documents. The [`ObjectStore`] trait is
//! the seam between the core and whatever object storage the deployment
//! provides; tests use [`MemoryObjectStore`], single-node deployments use
//! [`FsObjectStore`].
//!
//! # Split-Brain Detection
//!
//! Every key carries a generation counter. `put_if_generation` only succeeds
//! when the caller's expected generation matches, so a second writer for the
//! same tenant surfaces as [`StorageError::PreconditionFailed`] instead of a
//! silently clobbered snapshot.

use crate::db::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Durable object storage keyed by string paths
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object, or `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write an object unconditionally
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Write an object only if its current generation matches `expected`
    /// (`None` = the key must not exist). Returns the new generation.
    async fn put_if_generation(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<u64, StorageError>;

    /// Current generation of a key, or `None` if absent
    async fn generation(&self, key: &str) -> Result<Option<u64>, StorageError>;

    /// All keys under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Delete an object; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory object store for tests
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, (u64, Vec<u8>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|(_, bytes)| bytes.clone()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        let generation = objects.get(key).map(|(g, _)| *g).unwrap_or(0);
        objects.insert(key.to_string(), (generation + 1, bytes));
        Ok(())
    }

    async fn put_if_generation(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<u64, StorageError> {
        let mut objects = self.objects.write().await;
        let found = objects.get(key).map(|(g, _)| *g);
        if found != expected {
            return Err(StorageError::PreconditionFailed {
                key: key.to_string(),
                expected,
                found,
            });
        }
        let next = found.unwrap_or(0) + 1;
        objects.insert(key.to_string(), (next, bytes));
        Ok(next)
    }

    async fn generation(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|(g, _)| *g))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let objects = self.objects.read().await;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        objects.remove(key);
        Ok(())
    }
}

/// Filesystem-backed object store
///
/// Keys map directly onto paths under the base directory. Generations are
/// tracked in-process; that is sufficient to catch a second writer inside
/// one deployment, which is the failure mode a single-node filesystem store
/// can actually exhibit.
pub struct FsObjectStore {
    base: PathBuf,
    generations: RwLock<HashMap<String, u64>>,
}

impl FsObjectStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            generations: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys use '/' separators and ':' in log keys; both are path-safe on
        // the platforms this store targets
        self.base.join(Path::new(key))
    }

    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.write_bytes(key, &bytes).await?;
        let mut generations = self.generations.write().await;
        *generations.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn put_if_generation(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<u64, StorageError> {
        let mut generations = self.generations.write().await;
        let found = generations.get(key).copied();
        if found != expected {
            return Err(StorageError::PreconditionFailed {
                key: key.to_string(),
                expected,
                found,
            });
        }
        self.write_bytes(key, &bytes).await?;
        let next = found.unwrap_or(0) + 1;
        generations.insert(key.to_string(), next);
        Ok(next)
    }

    async fn generation(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let generations = self.generations.read().await;
        match generations.get(key).copied() {
            Some(g) => Ok(Some(g)),
            // A file that predates this process counts as generation 1
            None => {
                if tokio::fs::try_exists(self.path_for(key)).await? {
                    Ok(Some(1))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let root = self.base.clone();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&root) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut generations = self.generations.write().await;
        generations.remove(key);
        Ok(())
    }
}

/// Object key helpers shared by the snapshot codec and schema persistence
pub mod keys {
    /// Active compiled schema document
    pub fn schema_current(tenant: &str) -> String {
        format!("{tenant}/schema/current.json")
    }

    /// Historical schema version document
    pub fn schema_version(tenant: &str, version: u32) -> String {
        format!("{tenant}/schema/versions/v{version}.json")
    }

    /// Snapshot CSV for one table
    pub fn table_csv(tenant: &str, table: &str) -> String {
        format!("{tenant}/data/{table}.csv")
    }

    /// Snapshot manifest sidecar
    pub fn manifest(tenant: &str) -> String {
        format!("{tenant}/data/_manifest.json")
    }
}
