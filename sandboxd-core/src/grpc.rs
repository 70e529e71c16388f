//! The `tonic` service implementation of the single daemon-facing RPC
//! (§6.1): `Connect(stream HostMessage) -> stream ControlMessage`. This is
//! the only place in the crate that speaks `tonic::Request`/`Status`
//! directly; everything past the metadata extraction below hands off to
//! `StreamHandler::accept`.

use std::sync::Arc;

use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use sandboxd_wire::{ControlMessage, HostMessage, HostStream};

use crate::stream_handler::StreamHandler;

/// Metadata keys the transport's auth layer is expected to populate before
/// the request reaches this service. Real deployments terminate mTLS or
/// validate a bearer token in an interceptor upstream of this handler and
/// attach the resulting tenant/identity here; this crate only reads them.
pub const ORG_ID_METADATA_KEY: &str = "x-sandboxd-org-id";
pub const TOKEN_ID_METADATA_KEY: &str = "x-sandboxd-token-id";

/// Thin adapter from the generated `HostStream` trait to `StreamHandler`.
pub struct HostStreamService {
    stream_handler: Arc<StreamHandler>,
}

impl HostStreamService {
    pub fn new(stream_handler: Arc<StreamHandler>) -> Self {
        Self { stream_handler }
    }

    fn metadata_str<'a>(req: &'a Request<Streaming<HostMessage>>, key: &str) -> Option<&'a str> {
        req.metadata().get(key).and_then(|v| v.to_str().ok())
    }
}

#[tonic::async_trait]
impl HostStream for HostStreamService {
    type ConnectStream = UnboundedReceiverStream<Result<ControlMessage, Status>>;

    async fn connect(
        &self,
        request: Request<Streaming<HostMessage>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let org_id = Self::metadata_str(&request, ORG_ID_METADATA_KEY)
            .unwrap_or_default()
            .to_string();
        let token_id = Self::metadata_str(&request, TOKEN_ID_METADATA_KEY)
            .unwrap_or_default()
            .to_string();

        let inbound = request.into_inner();
        let rx = self
            .stream_handler
            .clone()
            .accept(org_id, token_id, inbound)
            .await
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        Ok(Response::new(UnboundedReceiverStream::new(rx)))
    }
}
