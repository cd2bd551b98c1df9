//! Proof Validation Engine
//!
//! Validates client-supplied edge-path proofs in O(path length) from the
//! ledger alone, with no graph traversal. The five checks run in a fixed
//! order and every failure is logged with its concrete reason before the
//! caller sees only the category: a rejected proof is treated as a possible
//! attack attempt, and the audit trail must say exactly what was wrong.
//!
//! A proof may pin an evaluation version. Revocations committed after that
//! version do not invalidate it, which makes decisions replayable for audit:
//! re-running a historical proof against today's ledger yields the answer
//! that was correct at the time.

use crate::models::compiled::CompiledSchema;
use crate::models::edge::{EdgeId, EdgeRecord};
use crate::models::mutation::Version;
use crate::models::proof::{EdgePathProof, ProofRejection};
use crate::services::edge_ledger::EdgeLedger;
use tracing::warn;

/// Validate an edge-path proof against the ledger and active schema
///
/// All five checks must pass:
///
/// 1. every id resolves to a ledger edge
/// 2. no edge is revoked as of the evaluation version
/// 3. the chain connects subject to object without breaks
/// 4. relationship kinds are legal at their positions and the final edge
///    carries the claimed capability
/// 5. the path is no longer than `max_traversal`
pub fn validate_proof(
    schema: &CompiledSchema,
    ledger: &EdgeLedger,
    proof: &EdgePathProof,
    max_traversal: usize,
) -> Result<(), ProofRejection> {
    let at_version = proof.at_version.unwrap_or_else(|| ledger.current_version());

    let result = check_proof(schema, ledger, proof, at_version, max_traversal);
    if let Err(rejection) = &result {
        warn!(
            subject = %proof.subject,
            object = %proof.object,
            capability = %proof.capability,
            edges = proof.edge_ids.len(),
            at_version = %at_version,
            reason = rejection.reason(),
            "proof rejected: {rejection}"
        );
    }
    result
}

fn check_proof(
    schema: &CompiledSchema,
    ledger: &EdgeLedger,
    proof: &EdgePathProof,
    at_version: Version,
    max_traversal: usize,
) -> Result<(), ProofRejection> {
    // Step 1: every id must resolve. An id that does not even parse is
    // still "unknown", named verbatim so the caller can see what was sent.
    let mut edges: Vec<&EdgeRecord> = Vec::with_capacity(proof.edge_ids.len());
    for raw in &proof.edge_ids {
        let edge = EdgeId::parse(raw)
            .and_then(|id| ledger.edge(id))
            .ok_or_else(|| ProofRejection::UnknownEdge {
                edge_id: raw.clone(),
            })?;
        // An edge minted after the evaluation version did not exist then
        if edge.created_version > at_version {
            return Err(ProofRejection::UnknownEdge {
                edge_id: raw.clone(),
            });
        }
        edges.push(edge);
    }

    // Step 2: no edge may be revoked as of the evaluation version
    for edge in &edges {
        if let Some(revoked_at) = edge.revoked_version {
            if revoked_at <= at_version {
                return Err(ProofRejection::RevokedEdge {
                    edge_id: edge.id,
                    revoked_at,
                });
            }
        }
    }

    // Step 3: chain connectivity, with the precise break index
    if edges.is_empty() {
        return Err(ProofRejection::BrokenChain { at: 0 });
    }
    let mut expected = proof.subject.as_str();
    for (index, edge) in edges.iter().enumerate() {
        if edge.source != expected {
            return Err(ProofRejection::BrokenChain { at: index });
        }
        expected = edge.target.as_str();
    }
    if expected != proof.object {
        return Err(ProofRejection::BrokenChain {
            at: edges.len() - 1,
        });
    }

    // Step 4: relationship legality along the path. Every edge before the
    // last must be schema-traversable; the last must be permission-bearing
    // with the claimed capability.
    let last = edges.len() - 1;
    for (index, edge) in edges.iter().enumerate() {
        let relation = schema.relation(&edge.relation);
        if index < last {
            let traversable = relation.map(|r| r.is_traversable()).unwrap_or(false);
            if !traversable {
                return Err(ProofRejection::IllegalRelationInPath {
                    at: index,
                    relation: edge.relation.clone(),
                });
            }
        } else {
            let permission = relation.map(|r| r.is_permission()).unwrap_or(false);
            if !permission {
                return Err(ProofRejection::IllegalRelationInPath {
                    at: index,
                    relation: edge.relation.clone(),
                });
            }
            match &edge.capability {
                Some(capability) if *capability == proof.capability => {}
                other => {
                    return Err(ProofRejection::CapabilityMismatch {
                        expected: proof.capability.clone(),
                        found: other
                            .as_ref()
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "none".to_string()),
                    });
                }
            }
        }
    }

    // Step 5: path length bound
    if edges.len() > max_traversal {
        return Err(ProofRejection::PathTooLong {
            len: edges.len(),
            max: max_traversal,
        });
    }

    Ok(())
}
