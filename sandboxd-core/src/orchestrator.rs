use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, warn};
use rand::seq::SliceRandom;
use sandboxd_registry::{select_host, select_host_for_source_vm, HostSnapshot, PlacementError, Registry};
use sandboxd_store::{Command, Sandbox, SandboxState, Store};
use sandboxd_wire::{
    control_message, generate_sandbox_id, host_message, CreateSandboxCmd, CreateSnapshotCmd,
    DestroySandboxCmd, DiscoverHostsCmd, DiscoveredSshHost, HostId, ListSourceVmsCmd, OrgId,
    PrepareSourceVmCmd, ReadSourceFileCmd, RequestId, RunCommandCmd, RunSourceCommandCmd,
    SandboxId, SnapshotCreated, SourceCommandResult, SourceFileResult, SourceHostCredentials,
    SourceVmInfo, SourceVmPrepared, SourceVmValidation, StartSandboxCmd, StopSandboxCmd,
    ValidateSourceVmCmd,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cancel::CancelSignal;
use crate::error::{DispatchError, OrchestratorError};
use crate::stream_handler::{ControlSink, StreamHandler};

/// Per-verb timeouts. Defaults match the recommendations; a deployment may
/// override any of them from its own configuration.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub create_sandbox: Duration,
    pub destroy: Duration,
    pub start_stop: Duration,
    pub snapshot: Duration,
    pub list_source_vms: Duration,
    pub validate: Duration,
    pub prepare_source_vm: Duration,
    pub discover_hosts: Duration,
    pub read_file: Duration,
    pub run_command_buffer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create_sandbox: Duration::from_secs(5 * 60),
            destroy: Duration::from_secs(2 * 60),
            start_stop: Duration::from_secs(2 * 60),
            snapshot: Duration::from_secs(5 * 60),
            list_source_vms: Duration::from_secs(30),
            validate: Duration::from_secs(30),
            prepare_source_vm: Duration::from_secs(5 * 60),
            discover_hosts: Duration::from_secs(2 * 60),
            read_file: Duration::from_secs(30),
            run_command_buffer: Duration::from_secs(30),
        }
    }
}

pub struct CreateSandboxInput {
    pub org_id: OrgId,
    pub source_vm: String,
    pub name: Option<String>,
    pub vcpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub ttl_seconds: u64,
    pub network: String,
    pub source_host_id: Option<String>,
    pub live: bool,
}

/// Composes placement, `SendAndWait`, and store writes behind the verbs
/// external callers invoke. Holds no long-lived per-request state itself;
/// every method is safe to call concurrently from unrelated request tasks.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    registry: Arc<Registry<ControlSink>>,
    stream_handler: Arc<StreamHandler>,
    heartbeat_timeout: Duration,
    timeouts: Timeouts,
    list_vms_concurrency: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        stream_handler: Arc<StreamHandler>,
        heartbeat_timeout: Duration,
        timeouts: Timeouts,
    ) -> Self {
        let registry = stream_handler.registry().clone();
        Self {
            store,
            registry,
            stream_handler,
            heartbeat_timeout,
            timeouts,
            list_vms_concurrency: 10,
        }
    }

    fn connected_hosts(&self, org_id: &OrgId) -> Vec<HostSnapshot> {
        self.registry.list_connected_by_org(org_id)
    }

    fn pick_source_vm_host(
        &self,
        org_id: &OrgId,
        vm_name: &str,
        req_cpus: u32,
        req_mem_mb: u64,
    ) -> Result<HostSnapshot, PlacementError> {
        let hosts = self.connected_hosts(org_id);
        select_host_for_source_vm(&hosts, vm_name, org_id, self.heartbeat_timeout, req_cpus, req_mem_mb, Instant::now())
    }

    fn domain_err(operation: &'static str, sandbox_id: &SandboxId, detail: impl Into<String>) -> OrchestratorError {
        OrchestratorError::Domain {
            operation,
            sandbox_id: sandbox_id.to_string(),
            detail: detail.into(),
        }
    }

    pub async fn create_sandbox(
        &self,
        input: CreateSandboxInput,
        cancel: &mut CancelSignal,
    ) -> Result<Sandbox, OrchestratorError> {
        let sandbox_id = generate_sandbox_id();
        let vcpus = input.vcpus.unwrap_or(2);
        let memory_mb = input.memory_mb.unwrap_or(2048);
        let hosts = self.connected_hosts(&input.org_id);
        let now = Instant::now();

        let (host, base_image) = match select_host(&hosts, &input.source_vm, &input.org_id, self.heartbeat_timeout, vcpus, memory_mb, now) {
            Ok(h) => (h, input.source_vm.clone()),
            Err(PlacementError::NoHealthyHostForImage(image_err)) => {
                let h = select_host_for_source_vm(&hosts, &input.source_vm, &input.org_id, self.heartbeat_timeout, vcpus, memory_mb, now)
                    .map_err(|vm_err| {
                        OrchestratorError::Placement(PlacementError::NoHealthyHostForVm(format!(
                            "no healthy host with image {image_err}; no healthy host for source vm {vm_err}"
                        )))
                    })?;
                (h, String::new())
            }
            Err(e) => return Err(e.into()),
        };

        let source_host = match &input.source_host_id {
            Some(id) => {
                let sh = self.store.get_source_host(id).await?;
                Some(SourceHostCredentials {
                    host: sh.host,
                    port: sh.port as u32,
                    user: sh.user,
                    private_key: sh.private_key,
                })
            }
            None => None,
        };

        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::CreateSandbox(CreateSandboxCmd {
                sandbox_id: sandbox_id.to_string(),
                name: input.name.clone().unwrap_or_default(),
                source_vm: input.source_vm.clone(),
                base_image: input.source_vm.clone(),
                vcpus,
                memory_mb,
                ttl_seconds: input.ttl_seconds,
                network: input.network.clone(),
                live: input.live,
                source_host,
            }),
        );

        let reply = self
            .stream_handler
            .send_and_wait(&host.host_id, cmd, self.timeouts.create_sandbox, cancel)
            .await?;

        let created = match reply.payload {
            Some(host_message::Payload::SandboxCreated(c)) => c,
            Some(host_message::Payload::ErrorReport(er)) => {
                return Err(DispatchError::HostError { host: host.host_id.to_string(), message: er.error }.into())
            }
            _ => return Err(DispatchError::UnexpectedReply(host.host_id.to_string()).into()),
        };

        let now = Utc::now();
        let sandbox = Sandbox {
            id: sandbox_id.clone(),
            org_id: input.org_id,
            host_id: host.host_id.clone(),
            name: input.name.unwrap_or_else(|| created.name.clone()),
            agent_id: String::new(),
            source_vm: input.source_vm,
            base_image,
            bridge: created.bridge,
            mac: created.mac,
            ip: created.ip,
            state: SandboxState::from_str(&created.state).unwrap_or(SandboxState::Creating),
            vcpus,
            memory_mb,
            ttl_seconds: input.ttl_seconds,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        if let Err(store_err) = self.store.create_sandbox(&sandbox).await {
            self.compensate_create_failure(host.host_id.clone(), sandbox_id.to_string());
            return Err(OrchestratorError::PersistAfterHostSuccess {
                host: host.host_id.to_string(),
                store_error: store_err,
            });
        }

        Ok(sandbox)
    }

    /// Issues a detached `DestroySandbox` for a sandbox the daemon already
    /// created but that failed to persist. Runs on its own task so a
    /// caller dropping the enclosing request future cannot abort cleanup;
    /// uses `CancelSignal::none()` rather than the original caller's signal
    /// for the same reason.
    fn compensate_create_failure(&self, host_id: HostId, sandbox_id: String) {
        let stream_handler = self.stream_handler.clone();
        let timeout = self.timeouts.destroy;
        tokio::spawn(async move {
            let request_id = RequestId::generate();
            let cmd = control_message(
                &request_id,
                control_message::Payload::DestroySandbox(DestroySandboxCmd { sandbox_id: sandbox_id.clone() }),
            );
            match stream_handler
                .send_and_wait(&host_id, cmd, timeout, &mut CancelSignal::none())
                .await
            {
                Ok(_) => warn!("compensating destroy for orphaned sandbox {sandbox_id} on host {host_id} completed"),
                Err(e) => error!(
                    "compensating destroy for orphaned sandbox {sandbox_id} on host {host_id} FAILED: {e} -- sandbox likely orphaned on the daemon"
                ),
            }
        });
    }

    pub async fn destroy_sandbox(
        &self,
        org_id: &OrgId,
        sandbox_id: &SandboxId,
        cancel: &mut CancelSignal,
    ) -> Result<(), OrchestratorError> {
        let sandbox = self.store.get_sandbox_by_org(org_id, sandbox_id).await?;
        if sandbox.state == SandboxState::Destroyed {
            return Err(Self::domain_err("destroy", sandbox_id, "sandbox already destroyed"));
        }

        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::DestroySandbox(DestroySandboxCmd { sandbox_id: sandbox_id.to_string() }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&sandbox.host_id, cmd, self.timeouts.destroy, cancel)
            .await?;

        match reply.payload {
            Some(host_message::Payload::SandboxDestroyed(_)) => {}
            Some(host_message::Payload::ErrorReport(er)) => {
                return Err(DispatchError::HostError { host: sandbox.host_id.to_string(), message: er.error }.into())
            }
            _ => return Err(DispatchError::UnexpectedReply(sandbox.host_id.to_string()).into()),
        }

        self.store.delete_sandbox(sandbox_id).await?;
        Ok(())
    }

    pub async fn start_sandbox(
        &self,
        org_id: &OrgId,
        sandbox_id: &SandboxId,
        cancel: &mut CancelSignal,
    ) -> Result<Sandbox, OrchestratorError> {
        let mut sandbox = self.store.get_sandbox_by_org(org_id, sandbox_id).await?;
        if sandbox.state == SandboxState::Destroyed {
            return Err(Self::domain_err("start", sandbox_id, "sandbox is destroyed"));
        }
        if sandbox.state == SandboxState::Running {
            return Err(Self::domain_err("start", sandbox_id, "sandbox is already running"));
        }

        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::StartSandbox(StartSandboxCmd { sandbox_id: sandbox_id.to_string() }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&sandbox.host_id, cmd, self.timeouts.start_stop, cancel)
            .await?;

        let (state, ip) = match reply.payload {
            Some(host_message::Payload::SandboxStarted(s)) => (s.state, s.ip),
            Some(host_message::Payload::ErrorReport(er)) => {
                return Err(DispatchError::HostError { host: sandbox.host_id.to_string(), message: er.error }.into())
            }
            _ => return Err(DispatchError::UnexpectedReply(sandbox.host_id.to_string()).into()),
        };

        sandbox.state = SandboxState::from_str(&state).unwrap_or(SandboxState::Running);
        sandbox.ip = ip;
        self.store.update_sandbox(&sandbox).await.map_err(|e| {
            Self::domain_err("start", sandbox_id, format!("host operation succeeded but persist failed: {e}"))
        })?;
        Ok(sandbox)
    }

    pub async fn stop_sandbox(
        &self,
        org_id: &OrgId,
        sandbox_id: &SandboxId,
        cancel: &mut CancelSignal,
    ) -> Result<Sandbox, OrchestratorError> {
        let mut sandbox = self.store.get_sandbox_by_org(org_id, sandbox_id).await?;
        if sandbox.state == SandboxState::Destroyed {
            return Err(Self::domain_err("stop", sandbox_id, "sandbox is destroyed"));
        }
        if sandbox.state == SandboxState::Stopped {
            return Err(Self::domain_err("stop", sandbox_id, "sandbox is already stopped"));
        }

        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::StopSandbox(StopSandboxCmd { sandbox_id: sandbox_id.to_string() }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&sandbox.host_id, cmd, self.timeouts.start_stop, cancel)
            .await?;

        let state = match reply.payload {
            Some(host_message::Payload::SandboxStopped(s)) => s.state,
            Some(host_message::Payload::ErrorReport(er)) => {
                return Err(DispatchError::HostError { host: sandbox.host_id.to_string(), message: er.error }.into())
            }
            _ => return Err(DispatchError::UnexpectedReply(sandbox.host_id.to_string()).into()),
        };

        sandbox.state = SandboxState::from_str(&state).unwrap_or(SandboxState::Stopped);
        self.store.update_sandbox(&sandbox).await.map_err(|e| {
            Self::domain_err("stop", sandbox_id, format!("host operation succeeded but persist failed: {e}"))
        })?;
        Ok(sandbox)
    }

    pub async fn create_snapshot(
        &self,
        org_id: &OrgId,
        sandbox_id: &SandboxId,
        snapshot_name: String,
        cancel: &mut CancelSignal,
    ) -> Result<SnapshotCreated, OrchestratorError> {
        let sandbox = self.store.get_sandbox_by_org(org_id, sandbox_id).await?;
        if sandbox.state == SandboxState::Destroyed {
            return Err(Self::domain_err("snapshot", sandbox_id, "sandbox is destroyed"));
        }

        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::CreateSnapshot(CreateSnapshotCmd {
                sandbox_id: sandbox_id.to_string(),
                snapshot_name,
            }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&sandbox.host_id, cmd, self.timeouts.snapshot, cancel)
            .await?;

        match reply.payload {
            Some(host_message::Payload::SnapshotCreated(s)) => Ok(s),
            Some(host_message::Payload::ErrorReport(er)) => {
                Err(DispatchError::HostError { host: sandbox.host_id.to_string(), message: er.error }.into())
            }
            _ => Err(DispatchError::UnexpectedReply(sandbox.host_id.to_string()).into()),
        }
    }

    pub async fn run_command(
        &self,
        org_id: &OrgId,
        sandbox_id: &SandboxId,
        command: String,
        timeout_seconds: u64,
        cancel: &mut CancelSignal,
    ) -> Result<Command, OrchestratorError> {
        let sandbox = self.store.get_sandbox_by_org(org_id, sandbox_id).await?;

        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::RunCommand(RunCommandCmd {
                sandbox_id: sandbox_id.to_string(),
                command: command.clone(),
                timeout_seconds,
            }),
        );
        let wait = Duration::from_secs(timeout_seconds) + self.timeouts.run_command_buffer;
        let started_at = Utc::now();
        let reply = self.stream_handler.send_and_wait(&sandbox.host_id, cmd, wait, cancel).await?;
        let ended_at = Utc::now();

        let result = match reply.payload {
            Some(host_message::Payload::CommandResult(r)) => r,
            Some(host_message::Payload::ErrorReport(er)) => {
                return Err(DispatchError::HostError { host: sandbox.host_id.to_string(), message: er.error }.into())
            }
            _ => return Err(DispatchError::UnexpectedReply(sandbox.host_id.to_string()).into()),
        };

        let record = Command {
            id: RequestId::generate().into_inner(),
            sandbox_id: sandbox_id.clone(),
            command,
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            started_at,
            ended_at,
        };
        if let Err(e) = self.store.create_command(&record).await {
            warn!("persisting command audit row for sandbox {sandbox_id}: {e}");
        }
        Ok(record)
    }

    /// Aggregates source VMs across every connected host of an org, ~10
    /// hosts in flight at a time. A per-host failure falls back to the
    /// cached registration snapshot rather than failing the whole call.
    pub async fn list_vms(&self, org_id: &OrgId, cancel: &CancelSignal) -> Vec<SourceVmInfo> {
        let hosts = self.connected_hosts(org_id);
        let sem = Arc::new(Semaphore::new(self.list_vms_concurrency));
        let mut set = JoinSet::new();

        for host in hosts {
            let sem = sem.clone();
            let stream_handler = self.stream_handler.clone();
            let timeout = self.timeouts.list_source_vms;
            let mut cancel = cancel.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore never closed");
                let cached = || host.registration.as_ref().map(|r| r.source_vms.clone()).unwrap_or_default();
                let request_id = RequestId::generate();
                let cmd = control_message(&request_id, control_message::Payload::ListSourceVms(ListSourceVmsCmd {}));
                match stream_handler.send_and_wait(&host.host_id, cmd, timeout, &mut cancel).await {
                    Ok(msg) => match msg.payload {
                        Some(host_message::Payload::SourceVmsList(list)) => list.vms,
                        _ => {
                            warn!("host {}: unexpected reply to ListSourceVms, using cached snapshot", host.host_id);
                            cached()
                        }
                    },
                    Err(e) => {
                        warn!("host {}: ListSourceVms failed ({e}), using cached snapshot", host.host_id);
                        cached()
                    }
                }
            });
        }

        let mut out = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(vms) = joined {
                out.extend(vms);
            }
        }
        out
    }

    pub async fn prepare_source_vm(
        &self,
        org_id: &OrgId,
        vm_name: &str,
        cancel: &mut CancelSignal,
    ) -> Result<SourceVmPrepared, OrchestratorError> {
        let host = self.pick_source_vm_host(org_id, vm_name, 0, 0)?;
        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::PrepareSourceVm(PrepareSourceVmCmd { vm_name: vm_name.to_string() }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&host.host_id, cmd, self.timeouts.prepare_source_vm, cancel)
            .await?;
        match reply.payload {
            Some(host_message::Payload::SourceVmPrepared(p)) => Ok(p),
            Some(host_message::Payload::ErrorReport(er)) => {
                Err(DispatchError::HostError { host: host.host_id.to_string(), message: er.error }.into())
            }
            _ => Err(DispatchError::UnexpectedReply(host.host_id.to_string()).into()),
        }
    }

    pub async fn validate_source_vm(
        &self,
        org_id: &OrgId,
        vm_name: &str,
        cancel: &mut CancelSignal,
    ) -> Result<SourceVmValidation, OrchestratorError> {
        let host = self.pick_source_vm_host(org_id, vm_name, 0, 0)?;
        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::ValidateSourceVm(ValidateSourceVmCmd { vm_name: vm_name.to_string() }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&host.host_id, cmd, self.timeouts.validate, cancel)
            .await?;
        match reply.payload {
            Some(host_message::Payload::SourceVmValidation(v)) => Ok(v),
            Some(host_message::Payload::ErrorReport(er)) => {
                Err(DispatchError::HostError { host: host.host_id.to_string(), message: er.error }.into())
            }
            _ => Err(DispatchError::UnexpectedReply(host.host_id.to_string()).into()),
        }
    }

    pub async fn run_source_command(
        &self,
        org_id: &OrgId,
        vm_name: &str,
        command: String,
        cancel: &mut CancelSignal,
    ) -> Result<SourceCommandResult, OrchestratorError> {
        let host = self.pick_source_vm_host(org_id, vm_name, 0, 0)?;
        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::RunSourceCommand(RunSourceCommandCmd { vm_name: vm_name.to_string(), command }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&host.host_id, cmd, self.timeouts.validate, cancel)
            .await?;
        match reply.payload {
            Some(host_message::Payload::SourceCommandResult(r)) => Ok(r),
            Some(host_message::Payload::ErrorReport(er)) => {
                Err(DispatchError::HostError { host: host.host_id.to_string(), message: er.error }.into())
            }
            _ => Err(DispatchError::UnexpectedReply(host.host_id.to_string()).into()),
        }
    }

    pub async fn read_source_file(
        &self,
        org_id: &OrgId,
        vm_name: &str,
        path: String,
        cancel: &mut CancelSignal,
    ) -> Result<SourceFileResult, OrchestratorError> {
        let host = self.pick_source_vm_host(org_id, vm_name, 0, 0)?;
        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::ReadSourceFile(ReadSourceFileCmd { vm_name: vm_name.to_string(), path }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&host.host_id, cmd, self.timeouts.read_file, cancel)
            .await?;
        match reply.payload {
            Some(host_message::Payload::SourceFileResult(r)) => Ok(r),
            Some(host_message::Payload::ErrorReport(er)) => {
                Err(DispatchError::HostError { host: host.host_id.to_string(), message: er.error }.into())
            }
            _ => Err(DispatchError::UnexpectedReply(host.host_id.to_string()).into()),
        }
    }

    /// Requires at least one connected daemon in the org and probes through
    /// one picked uniformly at random, to spread probing load across hosts.
    pub async fn discover_source_hosts(
        &self,
        org_id: &OrgId,
        ssh_config_content: String,
        cancel: &mut CancelSignal,
    ) -> Result<Vec<DiscoveredSshHost>, OrchestratorError> {
        let hosts = self.connected_hosts(org_id);
        let host = hosts
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| OrchestratorError::NoConnectedHost(org_id.to_string()))?;

        let request_id = RequestId::generate();
        let cmd = control_message(
            &request_id,
            control_message::Payload::DiscoverHosts(DiscoverHostsCmd { ssh_config_content }),
        );
        let reply = self
            .stream_handler
            .send_and_wait(&host.host_id, cmd, self.timeouts.discover_hosts, cancel)
            .await?;
        match reply.payload {
            Some(host_message::Payload::DiscoverHostsResult(r)) => Ok(r.hosts),
            Some(host_message::Payload::ErrorReport(er)) => {
                Err(DispatchError::HostError { host: host.host_id.to_string(), message: er.error }.into())
            }
            _ => Err(DispatchError::UnexpectedReply(host.host_id.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandboxd_store::MemStore;
    use sandboxd_wire::{CommandResult, ErrorReport, HostMessage, HostRegistration, SandboxCreated, SandboxDestroyed};
    use tokio::sync::mpsc;

    fn registration() -> HostRegistration {
        HostRegistration {
            host_id: "host-1".into(),
            hostname: "box1".into(),
            total_cpus: 4,
            total_memory_mb: 4096,
            total_disk_mb: 20_000,
            available_cpus: 4,
            available_memory_mb: 4096,
            available_disk_mb: 20_000,
            base_images: vec!["ubuntu-22.04".into()],
            source_vms: vec![SourceVmInfo {
                name: "web-server".into(),
                state: "running".into(),
                ip: "10.0.0.5".into(),
                prepared: true,
            }],
            ..Default::default()
        }
    }

    fn stack_with_timeouts(
        timeouts: Timeouts,
    ) -> (Orchestrator, mpsc::UnboundedReceiver<Result<sandboxd_wire::ControlMessage, tonic::Status>>) {
        let registry = Arc::new(Registry::new());
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let stream_handler = StreamHandler::new(registry, store.clone(), Duration::from_secs(90));
        let (tx, rx) = mpsc::unbounded_channel();
        stream_handler
            .register_connection(&HostId::from("host-1"), "org-1".into(), tx, &registration())
            .unwrap();
        let orchestrator = Orchestrator::new(store, stream_handler, Duration::from_secs(90), timeouts);
        (orchestrator, rx)
    }

    fn stack() -> (Orchestrator, mpsc::UnboundedReceiver<Result<sandboxd_wire::ControlMessage, tonic::Status>>) {
        stack_with_timeouts(Timeouts::default())
    }

    fn create_input() -> CreateSandboxInput {
        CreateSandboxInput {
            org_id: OrgId::from("org-1"),
            source_vm: "ubuntu-22.04".into(),
            name: Some("my-box".into()),
            vcpus: Some(2),
            memory_mb: Some(1024),
            ttl_seconds: 3600,
            network: "default".into(),
            source_host_id: None,
            live: false,
        }
    }

    fn seeded_sandbox(state: SandboxState) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: generate_sandbox_id(),
            org_id: OrgId::from("org-1"),
            host_id: HostId::from("host-1"),
            name: "box".into(),
            agent_id: String::new(),
            source_vm: "ubuntu-22.04".into(),
            base_image: "ubuntu-22.04".into(),
            bridge: String::new(),
            mac: String::new(),
            ip: String::new(),
            state,
            vcpus: 2,
            memory_mb: 1024,
            ttl_seconds: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn create_sandbox_happy_path_persists_sandbox() {
        let (orchestrator, mut rx) = stack();
        let sh = orchestrator.stream_handler.clone();

        let daemon = tokio::spawn(async move {
            let sent = rx.recv().await.unwrap().expect("control message");
            let reply = HostMessage {
                request_id: sent.request_id,
                payload: Some(host_message::Payload::SandboxCreated(SandboxCreated {
                    sandbox_id: String::new(),
                    name: "my-box".into(),
                    state: "RUNNING".into(),
                    ip: "10.0.0.9".into(),
                    mac: "aa:bb:cc:dd:ee:ff".into(),
                    bridge: "br0".into(),
                })),
            };
            sh.dispatch_inbound(&HostId::from("host-1"), reply);
        });

        let sandbox = orchestrator
            .create_sandbox(create_input(), &mut CancelSignal::none())
            .await
            .unwrap();
        daemon.await.unwrap();

        assert_eq!(sandbox.ip, "10.0.0.9");
        assert_eq!(sandbox.state, SandboxState::Running);
        let stored = orchestrator
            .store
            .get_sandbox_by_org(&OrgId::from("org-1"), &sandbox.id)
            .await
            .unwrap();
        assert_eq!(stored.host_id, HostId::from("host-1"));
    }

    #[tokio::test]
    async fn create_sandbox_falls_back_to_source_vm_when_no_image_matches() {
        let (orchestrator, mut rx) = stack();
        let sh = orchestrator.stream_handler.clone();
        let mut input = create_input();
        input.source_vm = "web-server".into();

        let daemon = tokio::spawn(async move {
            let sent = rx.recv().await.unwrap().expect("control message");
            let reply = HostMessage {
                request_id: sent.request_id,
                payload: Some(host_message::Payload::SandboxCreated(SandboxCreated {
                    sandbox_id: String::new(),
                    name: "my-box".into(),
                    state: "RUNNING".into(),
                    ip: "10.0.0.10".into(),
                    mac: String::new(),
                    bridge: String::new(),
                })),
            };
            sh.dispatch_inbound(&HostId::from("host-1"), reply);
        });

        let sandbox = orchestrator.create_sandbox(input, &mut CancelSignal::none()).await.unwrap();
        daemon.await.unwrap();
        assert_eq!(sandbox.base_image, "");
        assert_eq!(sandbox.source_vm, "web-server");
    }

    #[tokio::test]
    async fn create_sandbox_surfaces_host_error_report() {
        let (orchestrator, mut rx) = stack();
        let sh = orchestrator.stream_handler.clone();

        let daemon = tokio::spawn(async move {
            let sent = rx.recv().await.unwrap().expect("control message");
            let reply = HostMessage {
                request_id: sent.request_id,
                payload: Some(host_message::Payload::ErrorReport(ErrorReport {
                    sandbox_id: String::new(),
                    error: "no space left".into(),
                    context: "create".into(),
                })),
            };
            sh.dispatch_inbound(&HostId::from("host-1"), reply);
        });

        let err = orchestrator
            .create_sandbox(create_input(), &mut CancelSignal::none())
            .await
            .unwrap_err();
        daemon.await.unwrap();
        assert!(matches!(err, OrchestratorError::Dispatch(DispatchError::HostError { .. })));
    }

    #[tokio::test]
    async fn start_sandbox_rejects_already_running() {
        let (orchestrator, _rx) = stack();
        let sandbox = seeded_sandbox(SandboxState::Running);
        orchestrator.store.create_sandbox(&sandbox).await.unwrap();

        let err = orchestrator
            .start_sandbox(&OrgId::from("org-1"), &sandbox.id, &mut CancelSignal::none())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Domain { .. }));
    }

    #[tokio::test]
    async fn stop_sandbox_rejects_already_stopped() {
        let (orchestrator, _rx) = stack();
        let sandbox = seeded_sandbox(SandboxState::Stopped);
        orchestrator.store.create_sandbox(&sandbox).await.unwrap();

        let err = orchestrator
            .stop_sandbox(&OrgId::from("org-1"), &sandbox.id, &mut CancelSignal::none())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Domain { .. }));
    }

    #[tokio::test]
    async fn run_command_persists_audit_row_and_returns_result() {
        let (orchestrator, mut rx) = stack();
        let sh = orchestrator.stream_handler.clone();
        let sandbox = seeded_sandbox(SandboxState::Running);
        orchestrator.store.create_sandbox(&sandbox).await.unwrap();

        let daemon = tokio::spawn(async move {
            let sent = rx.recv().await.unwrap().expect("control message");
            let reply = HostMessage {
                request_id: sent.request_id,
                payload: Some(host_message::Payload::CommandResult(CommandResult {
                    stdout: "hello\n".into(),
                    stderr: String::new(),
                    exit_code: 0,
                    duration_ms: 12,
                })),
            };
            sh.dispatch_inbound(&HostId::from("host-1"), reply);
        });

        let record = orchestrator
            .run_command(&OrgId::from("org-1"), &sandbox.id, "echo hello".into(), 5, &mut CancelSignal::none())
            .await
            .unwrap();
        daemon.await.unwrap();

        assert_eq!(record.stdout, "hello\n");
        assert_eq!(record.exit_code, 0);
    }

    #[tokio::test]
    async fn list_vms_falls_back_to_cached_snapshot_when_host_does_not_reply() {
        let (orchestrator, _rx) = stack_with_timeouts(Timeouts {
            list_source_vms: Duration::from_millis(30),
            ..Timeouts::default()
        });
        // `_rx` is held but never drained, so the daemon never replies and
        // the call must fall back to the snapshot captured at registration.
        let vms = orchestrator.list_vms(&OrgId::from("org-1"), &CancelSignal::none()).await;
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name, "web-server");
    }

    #[tokio::test]
    async fn discover_source_hosts_requires_a_connected_host() {
        let registry = Arc::new(Registry::new());
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let stream_handler = StreamHandler::new(registry, store.clone(), Duration::from_secs(90));
        let orchestrator = Orchestrator::new(store, stream_handler, Duration::from_secs(90), Timeouts::default());

        let err = orchestrator
            .discover_source_hosts(&OrgId::from("org-empty"), "host web\n".into(), &mut CancelSignal::none())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoConnectedHost(_)));
    }

    #[tokio::test]
    async fn create_sandbox_compensates_with_destroy_when_store_persist_fails_after_host_success() {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(MemStore::new());
        store.fail_next_write();
        let store: Arc<dyn Store> = store;
        let stream_handler = StreamHandler::new(registry, store.clone(), Duration::from_secs(90));
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream_handler
            .register_connection(&HostId::from("host-1"), "org-1".into(), tx, &registration())
            .unwrap();
        let orchestrator = Orchestrator::new(store.clone(), stream_handler.clone(), Duration::from_secs(90), Timeouts::default());

        // The daemon answers CreateSandbox successfully, then answers
        // whatever compensating DestroySandbox the orchestrator issues once
        // the (forced-to-fail) store write comes back an error.
        let daemon = tokio::spawn(async move {
            let create = rx.recv().await.unwrap().expect("create control message");
            let reply = HostMessage {
                request_id: create.request_id,
                payload: Some(host_message::Payload::SandboxCreated(SandboxCreated {
                    sandbox_id: String::new(),
                    name: "my-box".into(),
                    state: "RUNNING".into(),
                    ip: "10.0.0.9".into(),
                    mac: "aa:bb:cc:dd:ee:ff".into(),
                    bridge: "br0".into(),
                })),
            };
            stream_handler.dispatch_inbound(&HostId::from("host-1"), reply);

            let destroy = rx.recv().await.unwrap().expect("compensating destroy control message");
            assert!(matches!(destroy.payload, Some(control_message::Payload::DestroySandbox(_))));
            let reply = HostMessage {
                request_id: destroy.request_id,
                payload: Some(host_message::Payload::SandboxDestroyed(Default::default())),
            };
            stream_handler.dispatch_inbound(&HostId::from("host-1"), reply);
        });

        let err = orchestrator
            .create_sandbox(create_input(), &mut CancelSignal::none())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PersistAfterHostSuccess { .. }));

        // The compensating destroy runs on its own detached task; give it a
        // beat to complete before asserting the daemon saw it.
        tokio::time::timeout(Duration::from_secs(1), daemon)
            .await
            .expect("compensating destroy did not complete in time")
            .unwrap();
    }
}
