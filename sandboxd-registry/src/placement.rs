use std::time::Duration;

use sandboxd_wire::OrgId;
use tokio::time::Instant;

use crate::HostSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("no hosts connected")]
    NoHosts,
    #[error("no healthy host for image {0}")]
    NoHealthyHostForImage(String),
    #[error("no healthy host for source vm {0}")]
    NoHealthyHostForVm(String),
}

/// `score = available_memory_mb + available_cpus * 1024`. One CPU is
/// treated as worth ~1 GiB of free RAM. This constant is pinned by the
/// spec's tests and must never change silently.
pub fn score(available_cpus: u32, available_memory_mb: u64) -> u64 {
    available_memory_mb + (available_cpus as u64) * 1024
}

fn is_fresh(h: &HostSnapshot, now: Instant, hb_timeout: Duration) -> bool {
    now.saturating_duration_since(h.last_heartbeat) <= hb_timeout
}

/// Picks the healthiest daemon in `org_id` able to run `base_image` with
/// at least `req_cpus`/`req_mem_mb` free. `req_cpus`/`req_mem_mb = 0`
/// disables the resource filter.
pub fn select_host(
    hosts: &[HostSnapshot],
    base_image: &str,
    org_id: &OrgId,
    hb_timeout: Duration,
    req_cpus: u32,
    req_mem_mb: u64,
    now: Instant,
) -> Result<HostSnapshot, PlacementError> {
    if hosts.is_empty() {
        return Err(PlacementError::NoHosts);
    }
    best_of(hosts.iter().filter(|h| {
        &h.org_id == org_id
            && is_fresh(h, now, hb_timeout)
            && h.registration
                .as_ref()
                .is_some_and(|r| r.base_images.iter().any(|i| i == base_image))
            && meets_resources(h, req_cpus, req_mem_mb)
    }))
    .ok_or_else(|| PlacementError::NoHealthyHostForImage(base_image.to_string()))
}

/// As `select_host`, but matches a long-lived source VM name instead of a
/// base image — used both directly by the source-VM verbs and as
/// `CreateSandbox`'s fallback when no base-image match exists.
pub fn select_host_for_source_vm(
    hosts: &[HostSnapshot],
    vm_name: &str,
    org_id: &OrgId,
    hb_timeout: Duration,
    req_cpus: u32,
    req_mem_mb: u64,
    now: Instant,
) -> Result<HostSnapshot, PlacementError> {
    if hosts.is_empty() {
        return Err(PlacementError::NoHosts);
    }
    best_of(hosts.iter().filter(|h| {
        &h.org_id == org_id
            && is_fresh(h, now, hb_timeout)
            && h.registration
                .as_ref()
                .is_some_and(|r| r.source_vms.iter().any(|v| v.name == vm_name))
            && meets_resources(h, req_cpus, req_mem_mb)
    }))
    .ok_or_else(|| PlacementError::NoHealthyHostForVm(vm_name.to_string()))
}

fn meets_resources(h: &HostSnapshot, req_cpus: u32, req_mem_mb: u64) -> bool {
    if req_cpus == 0 && req_mem_mb == 0 {
        return true;
    }
    match &h.registration {
        Some(r) => r.available_cpus >= req_cpus && r.available_memory_mb >= req_mem_mb,
        None => false,
    }
}

/// Among the survivors, picks the one with the highest score. Ties are
/// broken by iteration order, which is deterministic within a single
/// snapshot slice but otherwise unspecified.
fn best_of<'a>(iter: impl Iterator<Item = &'a HostSnapshot>) -> Option<HostSnapshot> {
    iter.max_by_key(|h| {
        let r = h.registration.as_ref();
        r.map(|r| score(r.available_cpus, r.available_memory_mb)).unwrap_or(0)
    })
    .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Registration;
    use sandboxd_wire::{HostId, SourceVmInfo};

    fn host(id: &str, org: &str, images: &[&str], vms: &[&str], cpus: u32, mem_mb: u64) -> HostSnapshot {
        HostSnapshot {
            host_id: HostId::from(id),
            org_id: OrgId::from(org),
            hostname: id.to_string(),
            last_heartbeat: Instant::now(),
            active_sandboxes: 0,
            source_vm_count: 0,
            registration: Some(Registration {
                total_cpus: cpus,
                total_memory_mb: mem_mb,
                total_disk_mb: 0,
                available_cpus: cpus,
                available_memory_mb: mem_mb,
                available_disk_mb: 0,
                base_images: images.iter().map(|s| s.to_string()).collect(),
                source_vms: vms
                    .iter()
                    .map(|name| SourceVmInfo {
                        name: name.to_string(),
                        state: "running".into(),
                        ip: String::new(),
                        prepared: true,
                    })
                    .collect(),
                bridges: vec![],
            }),
        }
    }

    #[test]
    fn picks_highest_score_among_matching_image() {
        // Host A: 4 CPU / 4096 MB -> score 8192. Host B: 4 CPU / 16384 MB -> score 20480.
        let a = host("host-a", "org-1", &["ubuntu-22.04"], &[], 4, 4096);
        let b = host("host-b", "org-1", &["ubuntu-22.04"], &[], 4, 16384);
        let hosts = vec![a, b];
        let picked = select_host(
            &hosts,
            "ubuntu-22.04",
            &OrgId::from("org-1"),
            Duration::from_secs(90),
            2,
            2048,
            Instant::now(),
        )
        .unwrap();
        assert_eq!(picked.host_id, HostId::from("host-b"));
    }

    #[test]
    fn no_hosts_at_all() {
        let err = select_host(
            &[],
            "ubuntu-22.04",
            &OrgId::from("org-1"),
            Duration::from_secs(90),
            0,
            0,
            Instant::now(),
        )
        .unwrap_err();
        assert_eq!(err, PlacementError::NoHosts);
    }

    #[test]
    fn falls_back_to_source_vm_match() {
        let h = host("host-a", "org-1", &["centos-9"], &["web-server"], 4, 4096);
        let hosts = vec![h];
        let by_image = select_host(
            &hosts,
            "web-server",
            &OrgId::from("org-1"),
            Duration::from_secs(90),
            0,
            0,
            Instant::now(),
        );
        assert!(by_image.is_err());
        let by_vm = select_host_for_source_vm(
            &hosts,
            "web-server",
            &OrgId::from("org-1"),
            Duration::from_secs(90),
            0,
            0,
            Instant::now(),
        )
        .unwrap();
        assert_eq!(by_vm.host_id, HostId::from("host-a"));
    }

    #[test]
    fn stale_heartbeat_excludes_host() {
        let mut h = host("host-a", "org-1", &["ubuntu-22.04"], &[], 4, 4096);
        h.last_heartbeat = Instant::now() - Duration::from_secs(200);
        let err = select_host(
            &[h],
            "ubuntu-22.04",
            &OrgId::from("org-1"),
            Duration::from_secs(90),
            0,
            0,
            Instant::now(),
        )
        .unwrap_err();
        assert_eq!(err, PlacementError::NoHealthyHostForImage("ubuntu-22.04".into()));
    }

    #[test]
    fn wrong_org_excludes_host() {
        let h = host("host-a", "org-2", &["ubuntu-22.04"], &[], 4, 4096);
        let err = select_host(
            &[h],
            "ubuntu-22.04",
            &OrgId::from("org-1"),
            Duration::from_secs(90),
            0,
            0,
            Instant::now(),
        )
        .unwrap_err();
        assert_eq!(err, PlacementError::NoHealthyHostForImage("ubuntu-22.04".into()));
    }

    #[test]
    fn insufficient_resources_excludes_host() {
        let h = host("host-a", "org-1", &["ubuntu-22.04"], &[], 1, 512);
        let err = select_host(
            &[h],
            "ubuntu-22.04",
            &OrgId::from("org-1"),
            Duration::from_secs(90),
            2,
            2048,
            Instant::now(),
        )
        .unwrap_err();
        assert_eq!(err, PlacementError::NoHealthyHostForImage("ubuntu-22.04".into()));
    }
}
