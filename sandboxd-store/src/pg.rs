use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use sandboxd_wire::{HostId, OrgId, SandboxId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};

use crate::model::{Command, Host, Sandbox, SandboxState, SourceHost};
use crate::{Store, StoreError};

const SANDBOX_COLUMNS: &str = "id, org_id, host_id, name, agent_id, source_vm, base_image, \
     bridge, mac, ip, state, vcpus, memory_mb, ttl_seconds, created_at, updated_at, deleted_at";

/// Postgres-backed `Store`. Holds the pool only; all serialization
/// discipline (transactions, advisory locks) is scoped to the method
/// that needs it rather than threaded through the trait.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(StoreError::from)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct SandboxRow {
    id: String,
    org_id: String,
    host_id: String,
    name: String,
    agent_id: String,
    source_vm: String,
    base_image: String,
    bridge: String,
    mac: String,
    ip: String,
    state: String,
    vcpus: i32,
    memory_mb: i64,
    ttl_seconds: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<SandboxRow> for Sandbox {
    type Error = StoreError;

    fn try_from(r: SandboxRow) -> Result<Self, StoreError> {
        Ok(Sandbox {
            id: SandboxId::from(r.id),
            org_id: OrgId::from(r.org_id),
            host_id: HostId::from(r.host_id),
            name: r.name,
            agent_id: r.agent_id,
            source_vm: r.source_vm,
            base_image: r.base_image,
            bridge: r.bridge,
            mac: r.mac,
            ip: r.ip,
            state: SandboxState::from_str(&r.state)?,
            vcpus: r.vcpus as u32,
            memory_mb: r.memory_mb as u64,
            ttl_seconds: r.ttl_seconds as u64,
            created_at: r.created_at,
            updated_at: r.updated_at,
            deleted_at: r.deleted_at,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_host(&self, id: &HostId) -> Result<Host, StoreError> {
        let row = sqlx::query(
            "SELECT id, org_id, hostname, status, total_cpus, total_memory_mb, total_disk_mb, \
             available_cpus, available_memory_mb, available_disk_mb, base_images, source_vms, \
             bridges, created_at, updated_at FROM hosts WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        let base_images_json: serde_json::Value = row.try_get("base_images")?;
        let base_images: Vec<String> = serde_json::from_value(base_images_json).unwrap_or_default();

        Ok(Host {
            id: HostId::from(row.try_get::<String, _>("id")?),
            org_id: OrgId::from(row.try_get::<String, _>("org_id")?),
            hostname: row.try_get("hostname")?,
            status: row.try_get("status")?,
            total_cpus: row.try_get::<i32, _>("total_cpus")? as u32,
            total_memory_mb: row.try_get::<i64, _>("total_memory_mb")? as u64,
            total_disk_mb: row.try_get::<i64, _>("total_disk_mb")? as u64,
            available_cpus: row.try_get::<i32, _>("available_cpus")? as u32,
            available_memory_mb: row.try_get::<i64, _>("available_memory_mb")? as u64,
            available_disk_mb: row.try_get::<i64, _>("available_disk_mb")? as u64,
            base_images,
            source_vms: row.try_get("source_vms")?,
            bridges: row.try_get("bridges")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn create_host(&self, host: &Host) -> Result<(), StoreError> {
        let base_images = serde_json::to_value(&host.base_images).unwrap_or_default();
        sqlx::query(
            "INSERT INTO hosts (id, org_id, hostname, status, total_cpus, total_memory_mb, \
             total_disk_mb, available_cpus, available_memory_mb, available_disk_mb, base_images, \
             source_vms, bridges) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(host.id.as_str())
        .bind(host.org_id.as_str())
        .bind(&host.hostname)
        .bind(&host.status)
        .bind(host.total_cpus as i32)
        .bind(host.total_memory_mb as i64)
        .bind(host.total_disk_mb as i64)
        .bind(host.available_cpus as i32)
        .bind(host.available_memory_mb as i64)
        .bind(host.available_disk_mb as i64)
        .bind(base_images)
        .bind(&host.source_vms)
        .bind(&host.bridges)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_host(&self, host: &Host) -> Result<(), StoreError> {
        let base_images = serde_json::to_value(&host.base_images).unwrap_or_default();
        let result = sqlx::query(
            "UPDATE hosts SET hostname = $2, status = $3, total_cpus = $4, total_memory_mb = $5, \
             total_disk_mb = $6, available_cpus = $7, available_memory_mb = $8, \
             available_disk_mb = $9, base_images = $10, source_vms = $11, bridges = $12, \
             updated_at = now() WHERE id = $1",
        )
        .bind(host.id.as_str())
        .bind(&host.hostname)
        .bind(&host.status)
        .bind(host.total_cpus as i32)
        .bind(host.total_memory_mb as i64)
        .bind(host.total_disk_mb as i64)
        .bind(host.available_cpus as i32)
        .bind(host.available_memory_mb as i64)
        .bind(host.available_disk_mb as i64)
        .bind(base_images)
        .bind(&host.source_vms)
        .bind(&host.bridges)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_host_heartbeat(
        &self,
        id: &HostId,
        available_cpus: u32,
        available_memory_mb: u64,
        available_disk_mb: u64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE hosts SET available_cpus = $2, available_memory_mb = $3, \
             available_disk_mb = $4, status = 'CONNECTED', updated_at = now() WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(available_cpus as i32)
        .bind(available_memory_mb as i64)
        .bind(available_disk_mb as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_sandbox(&self, s: &Sandbox) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sandboxes (id, org_id, host_id, name, agent_id, source_vm, base_image, \
             bridge, mac, ip, state, vcpus, memory_mb, ttl_seconds) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(s.id.as_str())
        .bind(s.org_id.as_str())
        .bind(s.host_id.as_str())
        .bind(&s.name)
        .bind(&s.agent_id)
        .bind(&s.source_vm)
        .bind(&s.base_image)
        .bind(&s.bridge)
        .bind(&s.mac)
        .bind(&s.ip)
        .bind(s.state.as_str())
        .bind(s.vcpus as i32)
        .bind(s.memory_mb as i64)
        .bind(s.ttl_seconds as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_sandbox(&self, id: &SandboxId) -> Result<Sandbox, StoreError> {
        let query = format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = $1 AND deleted_at IS NULL"
        );
        let row: SandboxRow = sqlx::query_as(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        row.try_into()
    }

    async fn get_sandbox_by_org(&self, org_id: &OrgId, id: &SandboxId) -> Result<Sandbox, StoreError> {
        let query = format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = $1 AND org_id = $2 AND deleted_at IS NULL"
        );
        let row: SandboxRow = sqlx::query_as(&query)
            .bind(id.as_str())
            .bind(org_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        row.try_into()
    }

    async fn list_sandboxes_by_org(&self, org_id: &OrgId) -> Result<Vec<Sandbox>, StoreError> {
        let query = format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE org_id = $1 AND deleted_at IS NULL ORDER BY created_at"
        );
        let rows: Vec<SandboxRow> = sqlx::query_as(&query)
            .bind(org_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Sandbox::try_from).collect()
    }

    async fn update_sandbox(&self, s: &Sandbox) -> Result<(), StoreError> {
        // pg_advisory_xact_lock serializes concurrent Start/Stop on the same
        // sandbox issued by two control-plane replicas; the lock is released
        // automatically at transaction commit.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(s.id.as_str())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "UPDATE sandboxes SET name = $2, bridge = $3, mac = $4, ip = $5, state = $6, \
             vcpus = $7, memory_mb = $8, ttl_seconds = $9, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(s.id.as_str())
        .bind(&s.name)
        .bind(&s.bridge)
        .bind(&s.mac)
        .bind(&s.ip)
        .bind(s.state.as_str())
        .bind(s.vcpus as i32)
        .bind(s.memory_mb as i64)
        .bind(s.ttl_seconds as i64)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_sandbox(&self, id: &SandboxId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sandboxes SET state = 'DESTROYED', deleted_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn count_sandboxes_by_host_ids(&self, ids: &[HostId]) -> Result<HashMap<HostId, i64>, StoreError> {
        let id_strs: Vec<String> = ids.iter().map(|h| h.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT host_id, count(*) AS count FROM sandboxes \
             WHERE host_id = ANY($1) AND deleted_at IS NULL GROUP BY host_id",
        )
        .bind(&id_strs)
        .fetch_all(&self.pool)
        .await?;
        let mut counts: HashMap<HostId, i64> = ids.iter().map(|h| (h.clone(), 0)).collect();
        for row in rows {
            let host_id: String = row.try_get("host_id")?;
            let count: i64 = row.try_get("count")?;
            counts.insert(HostId::from(host_id), count);
        }
        Ok(counts)
    }

    async fn create_command(&self, c: &Command) -> Result<(), StoreError> {
        let res = sqlx::query(
            "INSERT INTO commands (id, sandbox_id, command, stdout, stderr, exit_code, \
             duration_ms, started_at, ended_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&c.id)
        .bind(c.sandbox_id.as_str())
        .bind(&c.command)
        .bind(&c.stdout)
        .bind(&c.stderr)
        .bind(c.exit_code)
        .bind(c.duration_ms as i64)
        .bind(c.started_at)
        .bind(c.ended_at)
        .execute(&self.pool)
        .await;
        if let Err(e) = &res {
            warn!("create_command failed for sandbox {}: {e}", c.sandbox_id);
        }
        res.map(|_| ()).map_err(StoreError::from)
    }

    async fn get_source_host(&self, id: &str) -> Result<SourceHost, StoreError> {
        let row = sqlx::query(r#"SELECT id, host, port, "user", private_key FROM source_hosts WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(SourceHost {
            id: row.try_get("id")?,
            host: row.try_get("host")?,
            port: row.try_get::<i32, _>("port")? as u16,
            user: row.try_get("user")?,
            private_key: row.try_get("private_key")?,
        })
    }
}
