//! The durable record of orgs, hosts, sandboxes, commands, and source
//! hosts. Treated as an external collaborator by the orchestrator and
//! stream handler: this crate only needs to supply the typed CRUD
//! operations of `Store`, not a schema or migration tool opinion beyond
//! what `PgStore` needs to run.

mod error;
mod mem;
mod model;
mod pg;

pub use error::StoreError;
pub use mem::MemStore;
pub use model::{Command, Host, Sandbox, SandboxState, SourceHost};
pub use pg::PgStore;

use std::collections::HashMap;

use async_trait::async_trait;
use sandboxd_wire::{HostId, OrgId, SandboxId};

/// The persistence interface the orchestrator and stream handler depend
/// on. `Org`-scoped reads return `StoreError::NotFound` rather than a
/// permission error so existence across tenants is never leaked.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_host(&self, id: &HostId) -> Result<Host, StoreError>;
    async fn create_host(&self, host: &Host) -> Result<(), StoreError>;
    async fn update_host(&self, host: &Host) -> Result<(), StoreError>;
    async fn update_host_heartbeat(
        &self,
        id: &HostId,
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
    ) -> Result<(), StoreError>;

    async fn create_sandbox(&self, s: &Sandbox) -> Result<(), StoreError>;
    async fn get_sandbox(&self, id: &SandboxId) -> Result<Sandbox, StoreError>;
    async fn get_sandbox_by_org(&self, org_id: &OrgId, id: &SandboxId) -> Result<Sandbox, StoreError>;
    async fn list_sandboxes_by_org(&self, org_id: &OrgId) -> Result<Vec<Sandbox>, StoreError>;
    async fn update_sandbox(&self, s: &Sandbox) -> Result<(), StoreError>;
    /// Soft delete: sets `deleted_at` and `state = DESTROYED`.
    async fn delete_sandbox(&self, id: &SandboxId) -> Result<(), StoreError>;
    async fn count_sandboxes_by_host_ids(&self, ids: &[HostId]) -> Result<HashMap<HostId, i64>, StoreError>;

    async fn create_command(&self, c: &Command) -> Result<(), StoreError>;

    async fn get_source_host(&self, id: &str) -> Result<SourceHost, StoreError>;
}
