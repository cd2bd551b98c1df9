//! Service Layer Error Types
//!
//! One taxonomy for everything the core can refuse to do, grouped the way
//! callers need to react: input errors, authorization failures, back-pressure,
//! consistency faults, and external-collaborator failures.
//!
//! User-visible failures expose the category and a short message only; the
//! full reason (e.g. which proof step failed and why) goes to the log, never
//! across tenant boundaries.

use crate::db::StorageError;
use crate::models::compiled::RowValidationError;
use crate::models::mutation::Version;
use crate::models::proof::ProofRejection;
use thiserror::Error;

/// One located problem found while validating a schema upload
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SchemaIssue {
    /// JSON-pointer-style location, e.g. `/relationships/supervises/target`
    pub path: String,

    /// What is wrong
    pub message: String,

    /// A close defined name, when the problem is an unknown identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl SchemaIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Service operation errors
#[derive(Error, Debug)]
pub enum ServiceError {
    // ---- Input errors -----------------------------------------------------
    /// The tenant has no schema at all
    #[error("tenant has no schema installed")]
    SchemaMissing,

    /// A schema upload or activation failed validation
    #[error("schema validation failed: {}", format_issues(.issues))]
    SchemaValidationFailed { issues: Vec<SchemaIssue> },

    /// A row or edge violated a schema constraint
    #[error("constraint violated: {context}")]
    ConstraintViolated { context: String },

    /// Unknown tenant id
    #[error("unknown tenant: {tenant}")]
    UnknownTenant { tenant: String },

    /// Unknown table (entity or relationship name)
    #[error("table '{table}' is not declared by the active schema")]
    UnknownTable { table: String },

    /// Unknown edge id
    #[error("unknown edge: {edge_id}")]
    UnknownEdge { edge_id: String },

    /// Unknown entity instance
    #[error("unknown entity: {entity}/{id}")]
    UnknownEntity { entity: String, id: String },

    /// Request shape or content is invalid
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    // ---- Authorization failures ------------------------------------------
    /// A query answered "no access"
    #[error("not permitted")]
    NotPermitted,

    /// A client-supplied proof failed validation
    #[error("proof rejected: {0}")]
    ProofRejected(#[from] ProofRejection),

    // ---- Concurrency / back-pressure -------------------------------------
    /// A read exceeded its deadline
    #[error("operation '{operation}' timed out")]
    Timeout { operation: String },

    /// A connection could not keep up with its send queue
    #[error("connection dropped: slow consumer")]
    SlowConsumer,

    /// The tenant is over its resource quota
    #[error("tenant '{tenant}' is over quota")]
    OverQuota { tenant: String },

    // ---- Consistency ------------------------------------------------------
    /// Another writer committed a snapshot for this tenant
    #[error("snapshot is stale; another writer owns this tenant")]
    SnapshotStale,

    /// Recovery could not replay a log entry
    #[error("replay failed at version {version}: {reason}")]
    ReplayFailed { version: Version, reason: String },

    /// The tenant has been demoted to read-only after a recovery failure
    #[error("tenant '{tenant}' is degraded and read-only")]
    DegradedReadOnly { tenant: String },

    /// A schema version conflict (activation races, unknown versions)
    #[error("schema version conflict: {context}")]
    VersionConflict { context: String },

    // ---- External collaborators -------------------------------------------
    /// The object store or mutation log is failing
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Internal serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn format_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{}: {}", i.path, i.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<RowValidationError> for ServiceError {
    fn from(err: RowValidationError) -> Self {
        ServiceError::ConstraintViolated {
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

impl ServiceError {
    /// Create an unknown tenant error
    pub fn unknown_tenant(tenant: impl Into<String>) -> Self {
        Self::UnknownTenant {
            tenant: tenant.into(),
        }
    }

    /// Create an unknown table error
    pub fn unknown_table(table: impl Into<String>) -> Self {
        Self::UnknownTable {
            table: table.into(),
        }
    }

    /// Create an unknown edge error
    pub fn unknown_edge(edge_id: impl ToString) -> Self {
        Self::UnknownEdge {
            edge_id: edge_id.to_string(),
        }
    }

    /// Create an unknown entity error
    pub fn unknown_entity(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::UnknownEntity {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a constraint violation error
    pub fn constraint(context: impl Into<String>) -> Self {
        Self::ConstraintViolated {
            context: context.into(),
        }
    }

    /// Create a malformed request error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a version conflict error
    pub fn version_conflict(context: impl Into<String>) -> Self {
        Self::VersionConflict {
            context: context.into(),
        }
    }

    /// The HTTP status this error maps to
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::SchemaMissing
            | ServiceError::SchemaValidationFailed { .. }
            | ServiceError::ConstraintViolated { .. }
            | ServiceError::UnknownTable { .. }
            | ServiceError::MalformedRequest(_) => 400,

            ServiceError::NotPermitted | ServiceError::ProofRejected(_) => 403,

            ServiceError::UnknownTenant { .. }
            | ServiceError::UnknownEdge { .. }
            | ServiceError::UnknownEntity { .. } => 404,

            ServiceError::VersionConflict { .. } | ServiceError::SnapshotStale => 409,

            ServiceError::OverQuota { .. } | ServiceError::SlowConsumer => 429,

            ServiceError::Timeout { .. } => 504,

            ServiceError::DegradedReadOnly { .. }
            | ServiceError::ReplayFailed { .. }
            | ServiceError::Storage(_)
            | ServiceError::Serialization(_) => 503,
        }
    }

    /// Short category name for user-visible error bodies
    pub fn category(&self) -> &'static str {
        match self {
            ServiceError::SchemaMissing => "SchemaMissing",
            ServiceError::SchemaValidationFailed { .. } => "SchemaValidationFailed",
            ServiceError::ConstraintViolated { .. } => "ConstraintViolated",
            ServiceError::UnknownTenant { .. } => "UnknownTenant",
            ServiceError::UnknownTable { .. } => "UnknownTable",
            ServiceError::UnknownEdge { .. } => "UnknownEdge",
            ServiceError::UnknownEntity { .. } => "UnknownEntity",
            ServiceError::MalformedRequest(_) => "MalformedRequest",
            ServiceError::NotPermitted => "NotPermitted",
            ServiceError::ProofRejected(rejection) => rejection.reason(),
            ServiceError::Timeout { .. } => "Timeout",
            ServiceError::SlowConsumer => "SlowConsumer",
            ServiceError::OverQuota { .. } => "OverQuota",
            ServiceError::SnapshotStale => "SnapshotStale",
            ServiceError::VersionConflict { .. } => "VersionConflict",
            ServiceError::ReplayFailed { .. } => "ReplayFailed",
            ServiceError::DegradedReadOnly { .. } => "DegradedReadOnly",
            ServiceError::Storage(_) => "StorageUnavailable",
            ServiceError::Serialization(_) => "Internal",
        }
    }
}
