//! Edge-Path Proofs
//!
//! An edge-path proof is an ordered list of edge ids a client offers as
//! evidence for `subject can capability object`. Proofs are validated in
//! O(path length) from the ledger alone, with no graph traversal, which
//! makes an accepted proof replayable for audit long after the fact.

use crate::models::edge::{Capability, EdgeId};
use crate::models::mutation::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A client-submitted authorization proof
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgePathProof {
    /// The subject the proof claims access for
    pub subject: String,

    /// The object the proof claims access to
    pub object: String,

    /// The claimed capability
    pub capability: Capability,

    /// The edges forming the claimed path, in order from subject to object.
    /// Kept as raw strings: an id that does not even parse is still reported
    /// as `UnknownEdge` naming the offending value, not as a parse error.
    pub edge_ids: Vec<String>,

    /// Version the proof should be evaluated at; defaults to current.
    /// Revocations committed after this version do not invalidate the proof,
    /// which is what makes historical decisions auditable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_version: Option<Version>,
}

/// Why a proof was rejected
///
/// Every rejection is logged with its concrete reason as a potential attack
/// attempt; callers receive the category plus the fields needed to act on a
/// legitimate failure (the break index, the offending edge id).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProofRejection {
    #[error("edge '{edge_id}' does not exist")]
    UnknownEdge { edge_id: String },

    #[error("edge '{edge_id}' was revoked at version {revoked_at}")]
    RevokedEdge { edge_id: EdgeId, revoked_at: Version },

    #[error("path is not connected at index {at}")]
    BrokenChain { at: usize },

    #[error("relation '{relation}' at index {at} is not traversable for authorization")]
    IllegalRelationInPath { at: usize, relation: String },

    #[error("path grants '{found}' but the claim is for '{expected}'")]
    CapabilityMismatch {
        expected: Capability,
        found: String,
    },

    #[error("path length {len} exceeds the traversal limit {max}")]
    PathTooLong { len: usize, max: usize },
}

impl ProofRejection {
    /// Stable machine-readable reason name
    pub fn reason(&self) -> &'static str {
        match self {
            ProofRejection::UnknownEdge { .. } => "UnknownEdge",
            ProofRejection::RevokedEdge { .. } => "RevokedEdge",
            ProofRejection::BrokenChain { .. } => "BrokenChain",
            ProofRejection::IllegalRelationInPath { .. } => "IllegalRelationInPath",
            ProofRejection::CapabilityMismatch { .. } => "CapabilityMismatch",
            ProofRejection::PathTooLong { .. } => "PathTooLong",
        }
    }

    /// The break index, for chain and relation failures
    pub fn broken_at(&self) -> Option<usize> {
        match self {
            ProofRejection::BrokenChain { at }
            | ProofRejection::IllegalRelationInPath { at, .. } => Some(*at),
            _ => None,
        }
    }

    /// The offending edge id, for unknown/revoked-edge failures
    pub fn invalid_edge(&self) -> Option<String> {
        match self {
            ProofRejection::UnknownEdge { edge_id } => Some(edge_id.clone()),
            ProofRejection::RevokedEdge { edge_id, .. } => Some(edge_id.to_string()),
            _ => None,
        }
    }
}

/// Outcome of validating a proof or answering a query, as reported over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofVerdict {
    pub allowed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_edge: Option<String>,
}

impl ProofVerdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            broken_at: None,
            invalid_edge: None,
        }
    }

    pub fn rejected(rejection: &ProofRejection) -> Self {
        Self {
            allowed: false,
            reason: Some(rejection.reason().to_string()),
            broken_at: rejection.broken_at(),
            invalid_edge: rejection.invalid_edge(),
        }
    }
}
