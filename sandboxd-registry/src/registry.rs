use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::warn;
use sandboxd_wire::{BridgeInfo, HostId, OrgId, SourceVmInfo};
use tokio::time::Instant;

use crate::HostSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("host_id must not be empty")]
    EmptyHostId,
}

/// The capability snapshot a daemon advertises at registration time and
/// refreshes with heartbeats: total/available resources, base images, and
/// the long-lived source VMs it hosts.
#[derive(Debug, Clone)]
pub struct Registration {
    pub total_cpus: u32,
    pub total_memory_mb: u64,
    pub total_disk_mb: u64,
    pub available_cpus: u32,
    pub available_memory_mb: u64,
    pub available_disk_mb: u64,
    pub base_images: Vec<String>,
    pub source_vms: Vec<SourceVmInfo>,
    pub bridges: Vec<BridgeInfo>,
}

/// One connected daemon, owned by the registry between `register` and
/// `unregister`. The stream handle itself is owned exclusively by the
/// stream-handler task that accepted the connection; the registry only
/// keeps a cheap, clonable reference to it for bookkeeping symmetry with
/// the data model — actual sends go through the stream handler's own
/// `streams` map (see `sandboxd-core::StreamHandler`).
#[derive(Clone)]
pub struct ConnectedHost<S: Clone> {
    pub host_id: HostId,
    pub org_id: OrgId,
    pub hostname: String,
    pub stream: S,
    pub last_heartbeat: Instant,
    pub registration: Option<Registration>,
    pub active_sandboxes: u32,
    pub source_vm_count: u32,
}

/// In-memory map `host_id -> ConnectedHost`, guarded by a single
/// reader-writer lock. Generic over the stream-handle type `S` so it has
/// no transport dependency; `sandboxd-core` instantiates it with its own
/// sender type.
pub struct Registry<S: Clone> {
    hosts: RwLock<HashMap<HostId, ConnectedHost<S>>>,
}

impl<S: Clone> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> Registry<S> {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces any existing entry for `host_id` (last-writer-wins).
    pub fn register(
        &self,
        host_id: HostId,
        org_id: OrgId,
        hostname: String,
        stream: S,
    ) -> Result<(), RegistryError> {
        if host_id.is_empty() {
            return Err(RegistryError::EmptyHostId);
        }
        let entry = ConnectedHost {
            host_id: host_id.clone(),
            org_id,
            hostname,
            stream,
            last_heartbeat: Instant::now(),
            registration: None,
            active_sandboxes: 0,
            source_vm_count: 0,
        };
        let mut hosts = self.hosts.write().unwrap();
        if hosts.insert(host_id.clone(), entry).is_some() {
            warn!("registry: replaced existing entry for host {host_id}");
        }
        Ok(())
    }

    /// Idempotent removal.
    pub fn unregister(&self, host_id: &HostId) {
        self.hosts.write().unwrap().remove(host_id);
    }

    pub fn get_host(&self, host_id: &HostId) -> Option<HostSnapshot> {
        self.hosts.read().unwrap().get(host_id).map(snapshot_of)
    }

    pub fn list_connected(&self) -> Vec<HostSnapshot> {
        self.hosts.read().unwrap().values().map(snapshot_of).collect()
    }

    pub fn list_connected_by_org(&self, org_id: &OrgId) -> Vec<HostSnapshot> {
        self.hosts
            .read()
            .unwrap()
            .values()
            .filter(|h| &h.org_id == org_id)
            .map(snapshot_of)
            .collect()
    }

    pub fn set_registration(&self, host_id: &HostId, reg: Registration) {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(h) = hosts.get_mut(host_id) {
            h.registration = Some(reg);
            h.last_heartbeat = Instant::now();
        }
    }

    pub fn update_heartbeat(&self, host_id: &HostId) {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(h) = hosts.get_mut(host_id) {
            h.last_heartbeat = Instant::now();
        }
    }

    pub fn update_resources(&self, host_id: &HostId, available_cpus: u32, available_memory_mb: u64) {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(h) = hosts.get_mut(host_id) {
            if let Some(reg) = h.registration.as_mut() {
                reg.available_cpus = available_cpus;
                reg.available_memory_mb = available_memory_mb;
            }
        }
    }

    pub fn update_heartbeat_counts(&self, host_id: &HostId, active_sandboxes: u32, source_vm_count: u32) {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(h) = hosts.get_mut(host_id) {
            h.active_sandboxes = active_sandboxes;
            h.source_vm_count = source_vm_count;
        }
    }

    /// Returns the live stream handle for a host, if connected. Used by
    /// code that needs the transport-specific sender rather than the
    /// plain metadata snapshot (the stream handler keeps its own separate
    /// map for this in the common case; this exists for callers that only
    /// have a `Registry` handle, e.g. tests).
    pub fn get_stream(&self, host_id: &HostId) -> Option<S> {
        self.hosts.read().unwrap().get(host_id).map(|h| h.stream.clone())
    }
}

fn snapshot_of<S: Clone>(h: &ConnectedHost<S>) -> HostSnapshot {
    HostSnapshot {
        host_id: h.host_id.clone(),
        org_id: h.org_id.clone(),
        hostname: h.hostname.clone(),
        last_heartbeat: h.last_heartbeat,
        registration: h.registration.clone(),
        active_sandboxes: h.active_sandboxes,
        source_vm_count: h.source_vm_count,
    }
}

// `Arc` re-export convenience for callers building a stream handle type.
pub type Shared<T> = Arc<T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> HostId {
        HostId::from(s)
    }

    #[test]
    fn register_then_get_succeeds_exactly_once() {
        let reg: Registry<u32> = Registry::new();
        assert!(reg.get_host(&id("h1")).is_none());
        reg.register(id("h1"), OrgId::from("org-1"), "box1".into(), 7).unwrap();
        let snap = reg.get_host(&id("h1")).expect("should be registered");
        assert_eq!(snap.host_id, id("h1"));
        reg.unregister(&id("h1"));
        assert!(reg.get_host(&id("h1")).is_none());
    }

    #[test]
    fn empty_host_id_rejected() {
        let reg: Registry<u32> = Registry::new();
        let err = reg.register(id(""), OrgId::from("org-1"), "x".into(), 1).unwrap_err();
        assert!(matches!(err, RegistryError::EmptyHostId));
    }

    #[test]
    fn reconnect_replaces_and_updates_stream() {
        let reg: Registry<u32> = Registry::new();
        reg.register(id("h1"), OrgId::from("org-1"), "a".into(), 1).unwrap();
        reg.register(id("h1"), OrgId::from("org-1"), "a".into(), 2).unwrap();
        assert_eq!(reg.get_stream(&id("h1")), Some(2));
        assert_eq!(reg.list_connected().len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg: Registry<u32> = Registry::new();
        reg.unregister(&id("missing"));
        reg.register(id("h1"), OrgId::from("org-1"), "a".into(), 1).unwrap();
        reg.unregister(&id("h1"));
        reg.unregister(&id("h1"));
        assert!(reg.get_host(&id("h1")).is_none());
    }

    #[test]
    fn list_connected_by_org_filters() {
        let reg: Registry<u32> = Registry::new();
        reg.register(id("h1"), OrgId::from("org-1"), "a".into(), 1).unwrap();
        reg.register(id("h2"), OrgId::from("org-2"), "b".into(), 2).unwrap();
        let org1 = reg.list_connected_by_org(&OrgId::from("org-1"));
        assert_eq!(org1.len(), 1);
        assert_eq!(org1[0].host_id, id("h1"));
    }

    #[test]
    fn heartbeat_never_moves_backwards_in_practice() {
        let reg: Registry<u32> = Registry::new();
        reg.register(id("h1"), OrgId::from("org-1"), "a".into(), 1).unwrap();
        let first = reg.get_host(&id("h1")).unwrap().last_heartbeat;
        std::thread::sleep(Duration::from_millis(5));
        reg.update_heartbeat(&id("h1"));
        let second = reg.get_host(&id("h1")).unwrap().last_heartbeat;
        assert!(second >= first);
    }
}
