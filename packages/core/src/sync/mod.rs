//! Real-Time Sync
//!
//! The WebSocket fan-out layer: frame envelope types and the per-tenant
//! connection hub. Every committed mutation reaches every live connection
//! in strictly increasing version order; reconnecting clients catch up from
//! the retained log or are told to resync from a snapshot.

pub mod frames;
pub mod hub;

pub use frames::{ClientFrame, MutationFrame, ServerFrame};
pub use hub::{CloseReason, ConnectionId, ConnectionState, HandshakeOutcome, SyncHub};
