//! Channel-facing glue: routes inbound invokes through the stub tables and
//! inbound lifecycle announces through the registry.

use std::sync::Arc;

use plexus_ipc::{Channel, InboundHandler};
use plexus_protocol::{ErrorCode, Frame, InvokeRequest, InvokeResponse};

use crate::administrator::{Administrator, AnnounceOutcome};
use crate::stub::StubContext;

/// The invoke-label server: locates the implementation, dispatches through
/// the matching stub, and writes an error-coded response.
#[derive(Debug)]
pub struct InvokeHandler {
    administrator: Arc<Administrator>,
}

impl InvokeHandler {
    /// Returns a handler dispatching into `administrator`'s tables.
    pub fn new(administrator: Arc<Administrator>) -> Self {
        Self { administrator }
    }

    async fn service(&self, channel: &Channel, payload: Frame) -> Result<Frame, ErrorCode> {
        let request = InvokeRequest::decode(&mut payload.reader())
            .map_err(|_| ErrorCode::Serialization)?;

        let object = self
            .administrator
            .local_object(request.instance)
            .ok_or(ErrorCode::Unavailable)?;
        let target = object
            .query_interface(request.interface)
            .ok_or(ErrorCode::Unavailable)?;
        let stub = self
            .administrator
            .factory(request.interface)
            .ok_or(ErrorCode::Unavailable)?
            .stub;

        let context = StubContext {
            administrator: &self.administrator,
            channel,
            object: &target,
        };
        stub.dispatch(context, request.method, request.args).await
    }
}

#[async_trait::async_trait]
impl InboundHandler for InvokeHandler {
    async fn handle(&self, channel: Channel, payload: Frame) -> Option<Frame> {
        let response = match self.service(&channel, payload).await {
            Ok(result) => InvokeResponse {
                code: ErrorCode::Ok,
                result,
            },
            Err(code) => {
                tracing::debug!(channel = %channel.id(), %code, "invoke failed");
                InvokeResponse {
                    code,
                    result: Frame::new(),
                }
            }
        };

        let mut frame = Frame::new();
        response.encode(&mut frame);
        Some(frame)
    }
}

/// The announce-label server for endpoints that only import and export
/// objects (clients, test rigs): requests and revokes go to the registry,
/// anything else is acknowledged with an empty setup.
///
/// Communicator servers install their own announce handling instead, since
/// acquires and offers are endpoint policy there.
#[derive(Debug)]
pub struct AnnounceHandler {
    administrator: Arc<Administrator>,
}

impl AnnounceHandler {
    /// Returns a handler servicing lifecycle announces from `administrator`.
    pub fn new(administrator: Arc<Administrator>) -> Self {
        Self { administrator }
    }
}

#[async_trait::async_trait]
impl InboundHandler for AnnounceHandler {
    async fn handle(&self, channel: Channel, payload: Frame) -> Option<Frame> {
        let init = match plexus_protocol::Init::decode(&mut payload.reader()) {
            Ok(init) => init,
            Err(error) => {
                tracing::warn!(channel = %channel.id(), ?error, "undecodable announce");
                return None;
            }
        };

        match self.administrator.handle_announce(&channel, init) {
            AnnounceOutcome::Handled(Some(setup)) => {
                let mut frame = Frame::new();
                if let Err(error) = setup.encode(&mut frame) {
                    tracing::warn!(?error, "failed to encode setup reply");
                    return None;
                }
                Some(frame)
            }
            AnnounceOutcome::Handled(None) => None,
            AnnounceOutcome::Unhandled(init) => {
                tracing::debug!(
                    channel = %channel.id(),
                    kind = ?init.kind(),
                    "announce kind not serviced by this endpoint",
                );
                // An empty setup frame: accepted, no object offered.
                Some(Frame::new())
            }
        }
    }
}
