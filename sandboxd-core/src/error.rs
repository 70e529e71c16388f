use sandboxd_registry::PlacementError;
use sandboxd_store::StoreError;

/// Errors raised while terminating a single daemon stream, up through the
/// registration handshake.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("first message must be HostRegistration")]
    MissingRegistration,
    #[error("missing token identity")]
    MissingTokenIdentity,
    #[error("registry error: {0}")]
    Registry(#[from] sandboxd_registry::RegistryError),
    #[error("failed to send registration ack")]
    AckSendFailed,
    #[error("stream recv error: {0}")]
    StreamRecv(String),
}

/// Errors raised by `SendAndWait`, the correlated request/reply primitive
/// every orchestrator verb is built on.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("host {0} is not connected")]
    HostNotConnected(String),
    #[error("request_id must not be empty")]
    InvalidRequest,
    #[error("send to host {0} failed: {1}")]
    SendFailed(String, String),
    #[error("timed out waiting for reply from host {0}")]
    Timeout(String),
    #[error("cancelled waiting for reply from host {0}")]
    Cancelled(String),
    #[error("host {0} replied with an unexpected message shape")]
    UnexpectedReply(String),
    #[error("host {host} reported an error: {message}")]
    HostError { host: String, message: String },
}

/// Errors surfaced by an orchestrator verb: the union of everything that
/// can go wrong composing placement, dispatch, and store writes.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{operation} on sandbox {sandbox_id}: {detail}")]
    Domain {
        operation: &'static str,
        sandbox_id: String,
        detail: String,
    },
    #[error("no connected host for org {0}")]
    NoConnectedHost(String),
    #[error("create sandbox on host {host}: host reported success but persisting failed: {store_error}")]
    PersistAfterHostSuccess { host: String, store_error: StoreError },
}
