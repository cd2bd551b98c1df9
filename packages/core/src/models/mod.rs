//! Data Models
//!
//! This module contains the core data structures used throughout EdgeWarden:
//!
//! - `schema` - tenant schema source form (entities, relationships, indexes)
//! - `compiled` - compiled schemas: table definitions and row validators
//! - `edge` - server-minted edge records with soft revocation
//! - `mutation` - versioned mutation entries, requests, and outcomes
//! - `proof` - edge-path proofs and their rejection reasons
//!
//! Everything here is plain data: validation logic that needs tenant state
//! (uniqueness, referential existence, traversal) lives in the services.

pub mod compiled;
pub mod edge;
pub mod mutation;
pub mod proof;
pub mod schema;

pub use compiled::{CompiledSchema, RowValidationError, TableDefinition, TableKind};
pub use edge::{Capability, EdgeId, EdgeRecord};
pub use mutation::{
    MutationEntry, MutationKind, MutationOutcome, MutationPayload, MutationRequest, RevokeTarget,
    Version,
};
pub use proof::{EdgePathProof, ProofRejection, ProofVerdict};
pub use schema::{
    default_schema, EntityDefinition, FieldDefinition, FieldType, IndexDefinition, RelationKind,
    RelationshipDefinition, SchemaDefinition,
};
