//! The daemon-facing wire protocol: the tagged-union `ControlMessage`
//! (server -> daemon) and `HostMessage` (daemon -> server) carried over a
//! single bidirectional gRPC stream per daemon, plus the small set of
//! identifier newtypes shared by every other crate in this workspace.

pub mod ids;

pub use ids::{generate_sandbox_id, HostId, OrgId, RequestId, SandboxId};

pub mod proto {
    tonic::include_proto!("sandboxd.wire.v1");
}

pub use proto::host_stream_server::{HostStream, HostStreamServer};
pub use proto::{
    control_message, host_message, BridgeInfo, CommandResult, ControlMessage,
    CreateSandboxCmd, CreateSnapshotCmd, DestroySandboxCmd, DiscoverHostsCmd,
    DiscoverHostsResult, DiscoveredSshHost, ErrorReport, Heartbeat, HostMessage,
    HostRegistration, ListSourceVmsCmd, PrepareSourceVmCmd, ReadSourceFileCmd,
    RegistrationAck, ResourceReport, RunCommandCmd, RunSourceCommandCmd,
    SandboxCreated, SandboxDestroyed, SandboxStarted, SandboxStopped,
    SnapshotCreated, SourceCommandResult, SourceFileResult, SourceHostCredentials,
    SourceVmInfo, SourceVmPrepared, SourceVmValidation, SourceVmsList,
    StartSandboxCmd, StopSandboxCmd, ValidateSourceVmCmd,
};

/// Builds a `ControlMessage` with a fresh request id, the shape every
/// orchestrator verb needs before calling `SendAndWait`.
pub fn control_message(request_id: &RequestId, payload: control_message::Payload) -> ControlMessage {
    ControlMessage {
        request_id: request_id.as_str().to_string(),
        payload: Some(payload),
    }
}

/// True if this `HostMessage` is an unsolicited event (empty request id),
/// as opposed to a reply correlated to a prior command.
pub fn is_unsolicited(msg: &HostMessage) -> bool {
    msg.request_id.is_empty()
}
