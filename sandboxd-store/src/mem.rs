use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sandboxd_wire::{HostId, OrgId, SandboxId};

use crate::model::{Command, Host, Sandbox};
use crate::{Store, StoreError};

/// In-memory `Store` used by orchestrator and stream handler tests.
/// Mirrors `PgStore`'s org-scoping and soft-delete semantics without a
/// database.
#[derive(Default)]
pub struct MemStore {
    hosts: Mutex<HashMap<HostId, Host>>,
    sandboxes: Mutex<HashMap<SandboxId, Sandbox>>,
    commands: Mutex<Vec<Command>>,
    source_hosts: Mutex<HashMap<String, crate::model::SourceHost>>,
    fail_next_write: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_source_host(&self, sh: crate::model::SourceHost) {
        self.source_hosts.lock().unwrap().insert(sh.id.clone(), sh);
    }

    /// Makes the next `create_sandbox`/`update_sandbox` call return
    /// `StoreError::Other` instead of touching `sandboxes`, to exercise the
    /// orchestrator's compensating-destroy path (host succeeds, persist
    /// fails) without a real database to fail on demand. One-shot: clears
    /// itself on the first write attempt after being armed, successful or
    /// not.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_next_write.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_host(&self, id: &HostId) -> Result<Host, StoreError> {
        self.hosts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_host(&self, host: &Host) -> Result<(), StoreError> {
        let mut hosts = self.hosts.lock().unwrap();
        if hosts.contains_key(&host.id) {
            return Err(StoreError::AlreadyExists);
        }
        hosts.insert(host.id.clone(), host.clone());
        Ok(())
    }

    async fn update_host(&self, host: &Host) -> Result<(), StoreError> {
        let mut hosts = self.hosts.lock().unwrap();
        if !hosts.contains_key(&host.id) {
            return Err(StoreError::NotFound);
        }
        hosts.insert(host.id.clone(), host.clone());
        Ok(())
    }

    async fn update_host_heartbeat(
        &self,
        id: &HostId,
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
    ) -> Result<(), StoreError> {
        let mut hosts = self.hosts.lock().unwrap();
        let host = hosts.get_mut(id).ok_or(StoreError::NotFound)?;
        host.available_cpus = available_cpus;
        host.available_memory_mb = available_memory_mb;
        host.available_disk_mb = available_disk_mb;
        host.status = "CONNECTED".to_string();
        host.updated_at = Utc::now();
        Ok(())
    }

    async fn create_sandbox(&self, s: &Sandbox) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Other("injected failure".into()));
        }
        let mut sandboxes = self.sandboxes.lock().unwrap();
        if sandboxes.contains_key(&s.id) {
            return Err(StoreError::AlreadyExists);
        }
        sandboxes.insert(s.id.clone(), s.clone());
        Ok(())
    }

    async fn get_sandbox(&self, id: &SandboxId) -> Result<Sandbox, StoreError> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(id)
            .filter(|s| s.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_sandbox_by_org(&self, org_id: &OrgId, id: &SandboxId) -> Result<Sandbox, StoreError> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(id)
            .filter(|s| s.deleted_at.is_none() && &s.org_id == org_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_sandboxes_by_org(&self, org_id: &OrgId) -> Result<Vec<Sandbox>, StoreError> {
        let mut out: Vec<Sandbox> = self
            .sandboxes
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.deleted_at.is_none() && &s.org_id == org_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn update_sandbox(&self, s: &Sandbox) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Other("injected failure".into()));
        }
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let existing = sandboxes.get(&s.id).ok_or(StoreError::NotFound)?;
        if existing.deleted_at.is_some() {
            return Err(StoreError::NotFound);
        }
        let mut updated = s.clone();
        updated.updated_at = Utc::now();
        sandboxes.insert(s.id.clone(), updated);
        Ok(())
    }

    async fn delete_sandbox(&self, id: &SandboxId) -> Result<(), StoreError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let s = sandboxes.get_mut(id).ok_or(StoreError::NotFound)?;
        if s.deleted_at.is_some() {
            return Err(StoreError::NotFound);
        }
        s.state = crate::model::SandboxState::Destroyed;
        s.deleted_at = Some(Utc::now());
        s.updated_at = Utc::now();
        Ok(())
    }

    async fn count_sandboxes_by_host_ids(&self, ids: &[HostId]) -> Result<HashMap<HostId, i64>, StoreError> {
        let mut counts: HashMap<HostId, i64> = ids.iter().map(|h| (h.clone(), 0)).collect();
        for s in self.sandboxes.lock().unwrap().values() {
            if s.deleted_at.is_none() {
                if let Some(c) = counts.get_mut(&s.host_id) {
                    *c += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn create_command(&self, c: &Command) -> Result<(), StoreError> {
        self.commands.lock().unwrap().push(c.clone());
        Ok(())
    }

    async fn get_source_host(&self, id: &str) -> Result<crate::model::SourceHost, StoreError> {
        self.source_hosts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandboxd_wire::generate_sandbox_id;

    fn sandbox(org: &str, host: &str) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: generate_sandbox_id(),
            org_id: OrgId::from(org),
            host_id: HostId::from(host),
            name: "test".into(),
            agent_id: String::new(),
            source_vm: String::new(),
            base_image: "base".into(),
            bridge: String::new(),
            mac: String::new(),
            ip: String::new(),
            state: crate::model::SandboxState::Creating,
            vcpus: 1,
            memory_mb: 512,
            ttl_seconds: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = MemStore::new();
        let s = sandbox("org-a", "host-1");
        store.create_sandbox(&s).await.unwrap();
        let got = store.get_sandbox(&s.id).await.unwrap();
        assert_eq!(got.id, s.id);
    }

    #[tokio::test]
    async fn get_sandbox_by_org_rejects_cross_tenant_access() {
        let store = MemStore::new();
        let s = sandbox("org-a", "host-1");
        store.create_sandbox(&s).await.unwrap();
        let err = store
            .get_sandbox_by_org(&OrgId::from("org-b"), &s.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn delete_sandbox_is_not_visible_afterwards() {
        let store = MemStore::new();
        let s = sandbox("org-a", "host-1");
        store.create_sandbox(&s).await.unwrap();
        store.delete_sandbox(&s.id).await.unwrap();
        let err = store.get_sandbox(&s.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        let err = store.delete_sandbox(&s.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn fail_next_write_is_one_shot() {
        let store = MemStore::new();
        let s = sandbox("org-a", "host-1");
        store.fail_next_write();
        let err = store.create_sandbox(&s).await.unwrap_err();
        assert!(matches!(err, StoreError::Other(_)));
        assert!(store.get_sandbox(&s.id).await.is_err(), "failed write must not have landed");

        // armed flag was consumed by the failed attempt above, so a retry succeeds.
        store.create_sandbox(&s).await.unwrap();
        assert!(store.get_sandbox(&s.id).await.is_ok());
    }

    #[tokio::test]
    async fn count_sandboxes_by_host_ids_seeds_zero_for_idle_hosts() {
        let store = MemStore::new();
        let s = sandbox("org-a", "host-1");
        store.create_sandbox(&s).await.unwrap();
        let counts = store
            .count_sandboxes_by_host_ids(&[HostId::from("host-1"), HostId::from("host-2")])
            .await
            .unwrap();
        assert_eq!(counts[&HostId::from("host-1")], 1);
        assert_eq!(counts[&HostId::from("host-2")], 0);
    }
}
