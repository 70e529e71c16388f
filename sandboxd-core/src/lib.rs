//! The dispatch and lifecycle subsystem of the control plane: the stream
//! handler that terminates one bidirectional gRPC stream per daemon, the
//! correlated request/reply primitive it exposes, and the orchestrator
//! verbs built on top of it.
//!
//! `sandboxd-registry` and `sandboxd-store` are consumed as external
//! collaborators; this crate wires them together and is the only one that
//! knows about the `tonic` transport.

mod cancel;
mod error;
mod grpc;
mod orchestrator;
mod pending;
mod stream_handler;

pub use cancel::{Cancel, CancelSignal};
pub use error::{ConnectionError, DispatchError, OrchestratorError};
pub use grpc::HostStreamService;
pub use orchestrator::{CreateSandboxInput, Orchestrator, Timeouts};
pub use stream_handler::{ControlSink, StreamHandler};
