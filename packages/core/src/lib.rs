//! EdgeWarden Core
//!
//! This crate provides the per-tenant authorization state machine for the
//! EdgeWarden relationship-based authorization (ReBAC) platform: the
//! in-memory graph and its tabular projection, edge-path proof validation,
//! the versioned mutation ledger, WebSocket fan-out with catch-up sync, and
//! schema-driven dynamic table creation.
//!
//! # Architecture
//!
//! - **Single-writer actors**: one actor per tenant; mutations serialize,
//!   reads run concurrently, tenants share nothing
//! - **Schema-as-data**: a compiled schema is a data structure the core
//!   interprets; entities and relationships are rows in tables whose shape
//!   it determines
//! - **Soft revocation**: edges are tombstoned, never deleted, so proofs
//!   stay auditable after the fact
//! - **Snapshot + log durability**: CSV snapshots in object storage plus a
//!   bounded key-value mutation log reconstruct state exactly
//!
//! # Modules
//!
//! - [`models`] - schemas, edges, mutations, proofs
//! - [`services`] - registry, store, index, cache, ledger, proof validation
//! - [`tenant`] - per-tenant actors and the process-wide registry
//! - [`sync`] - WebSocket frames and the fan-out hub
//! - [`db`] - object storage, snapshots, and the durable mutation log
//! - [`server`] - the HTTP/WebSocket surface
//! - [`config`] - tunables and their defaults

pub mod config;
pub mod db;
pub mod models;
pub mod server;
pub mod services;
pub mod sync;
pub mod tenant;

// Re-exports
pub use config::CoreConfig;
pub use db::{FsObjectStore, KvMutationLog, MemoryMutationLog, MemoryObjectStore, StorageError};
pub use models::{
    Capability, CompiledSchema, EdgeId, EdgePathProof, EdgeRecord, MutationEntry,
    MutationOutcome, MutationRequest, ProofRejection, SchemaDefinition, Version,
};
pub use services::ServiceError;
pub use tenant::{TenantHandle, TenantRegistry};
