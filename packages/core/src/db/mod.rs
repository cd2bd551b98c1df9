//! Persistence Layer
//!
//! This module handles all durable state interactions:
//!
//! - Object storage for CSV snapshots, manifests, and schema documents
//! - The bounded key-value mutation log used for catch-up and recovery
//! - The CSV snapshot codec with per-table integrity checksums
//!
//! # Architecture
//!
//! The in-memory state of a tenant is authoritative while the tenant is
//! resident; durability comes from the combination of a snapshot (CSV tables
//! as of some version) and the suffix of the mutation log after that
//! version. Both sides of that combination live behind traits so tests run
//! against in-memory fakes and deployments pick their own backends.

mod error;
pub mod mutation_log;
pub mod object_store;
pub mod snapshot;

pub use error::StorageError;
pub use mutation_log::{KvMutationLog, MemoryMutationLog, MutationLog};
pub use object_store::{keys, FsObjectStore, MemoryObjectStore, ObjectStore};
pub use snapshot::{
    load_snapshot, write_snapshot, Row, SnapshotData, SnapshotManifest, TableDigest,
};
