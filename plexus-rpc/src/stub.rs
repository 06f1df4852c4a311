//! The generated-looking glue layer: stubs demarshal and invoke, proxies
//! marshal and wait.
//!
//! For each interface the process registers a [`ProxyStubPair`]: a stub
//! dispatching on the dense method ordinal and a constructor wrapping a wire
//! handle into the typed proxy. Registration happens once at startup, either
//! statically or through [`load_proxy_stubs`](crate::load_proxy_stubs).

use std::fmt;
use std::sync::Arc;

use plexus_ipc::Channel;
use plexus_protocol::{ErrorCode, Frame, InterfaceId, MethodId, Version};

use crate::administrator::Administrator;
use crate::object::RemoteObject;
use crate::proxy::ProxyHandle;

/// Everything a stub method handler needs beyond its arguments.
#[derive(Debug)]
pub struct StubContext<'a> {
    /// The process registry, for resolving interface-typed arguments.
    pub administrator: &'a Arc<Administrator>,
    /// The channel the invoke arrived on.
    pub channel: &'a Channel,
    /// The implementation the call targets, already resolved to the invoked
    /// interface.
    pub object: &'a RemoteObject,
}

/// Server-side demarshaller for one interface.
///
/// Implementations read typed arguments from the request frame, invoke the
/// resolved implementation, and write return values into the response frame.
/// Unknown ordinals are [`ErrorCode::Unavailable`]; an unresolvable
/// interface-typed argument is [`ErrorCode::RpcCallFailed`].
#[async_trait::async_trait]
pub trait StubDispatch: Send + Sync {
    /// Handles one invocation of `method`.
    async fn dispatch(
        &self,
        context: StubContext<'_>,
        method: MethodId,
        args: Frame,
    ) -> Result<Frame, ErrorCode>;
}

/// The registered factory glue for one interface.
#[derive(Clone)]
pub struct ProxyStubPair {
    /// Interface this pair serves.
    pub interface_id: InterfaceId,
    /// Version of the interface contract.
    pub version: Version,
    /// Wraps a wire handle into the typed proxy, erased as a
    /// [`RemoteObject`].
    pub proxy: fn(ProxyHandle) -> RemoteObject,
    /// Demarshaller for inbound invokes.
    pub stub: Arc<dyn StubDispatch>,
}

impl fmt::Debug for ProxyStubPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyStubPair")
            .field("interface", &self.interface_id)
            .field("version", &self.version)
            .finish()
    }
}
