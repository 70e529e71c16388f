use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sandboxd_wire::{HostId, OrgId, SandboxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SandboxState {
    Creating,
    Running,
    Stopped,
    Destroyed,
    Error,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Creating => "CREATING",
            SandboxState::Running => "RUNNING",
            SandboxState::Stopped => "STOPPED",
            SandboxState::Destroyed => "DESTROYED",
            SandboxState::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for SandboxState {
    type Err = crate::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(SandboxState::Creating),
            "RUNNING" => Ok(SandboxState::Running),
            "STOPPED" => Ok(SandboxState::Stopped),
            "DESTROYED" => Ok(SandboxState::Destroyed),
            "ERROR" => Ok(SandboxState::Error),
            other => Err(crate::StoreError::Invalid(format!("unknown sandbox state {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: SandboxId,
    pub org_id: OrgId,
    pub host_id: HostId,
    pub name: String,
    pub agent_id: String,
    pub source_vm: String,
    pub base_image: String,
    pub bridge: String,
    pub mac: String,
    pub ip: String,
    pub state: SandboxState,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub ttl_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub sandbox_id: SandboxId,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub org_id: OrgId,
    pub hostname: String,
    pub status: String,
    pub total_cpus: u32,
    pub total_memory_mb: u64,
    pub total_disk_mb: u64,
    pub available_cpus: u32,
    pub available_memory_mb: u64,
    pub available_disk_mb: u64,
    pub base_images: Vec<String>,
    pub source_vms: serde_json::Value,
    pub bridges: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHost {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: String,
}
