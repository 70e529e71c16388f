//! The in-memory registry of connected daemons and the pure placement
//! policy that picks one for a given request.
//!
//! This crate knows nothing about gRPC or the database; `sandboxd-core`
//! wires it to the real stream transport and store.

mod placement;
mod registry;

pub use placement::{select_host, select_host_for_source_vm, score, PlacementError};
pub use registry::{ConnectedHost, Registration, Registry, RegistryError};

use tokio::time::Instant;

/// A read-only, by-value copy of a `ConnectedHost`'s metadata. Returned by
/// `Registry::get_host`/`list_connected*` so callers never hold the
/// registry lock while iterating or dispatching.
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    pub host_id: sandboxd_wire::HostId,
    pub org_id: sandboxd_wire::OrgId,
    pub hostname: String,
    pub last_heartbeat: Instant,
    pub registration: Option<Registration>,
    pub active_sandboxes: u32,
    pub source_vm_count: u32,
}
