//! Tenant Actors
//!
//! One logical actor per tenant: all mutations serialize through a single
//! writer, reads run concurrently against consistent state, and actors
//! share nothing across tenants. The registry is the only process-wide
//! state; it creates actors lazily and evicts them when idle.

pub mod actor;
pub mod registry;
pub mod state;

pub use actor::TenantHandle;
pub use registry::TenantRegistry;
pub use state::{TenantState, TenantStats};
