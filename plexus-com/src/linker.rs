//! Cross-host linking: the remote-linker interface, its proxy/stub glue,
//! and the [`RemoteHost`] that drives it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plexus_net_utils::NodeAddress;
use plexus_protocol::{ErrorCode, ExchangeId, Frame, InterfaceId, MethodId, Version};
use plexus_rpc::{
    Administrator, ObjectRef, ProxyHandle, ProxyStubPair, RemoteObject, StubContext, StubDispatch,
};

use crate::client::{ClientMode, CommunicatorClient};
use crate::registry::ServiceRegistry;

/// Interface id of the remote linker contract.
pub const REMOTE_LINKER_INTERFACE: InterfaceId = InterfaceId(0x71);

/// Version of the remote linker contract.
const REMOTE_LINKER_VERSION: Version = Version(1);

/// Class name a communicator publishes its linker under.
pub const REMOTE_LINKER_CLASS: &str = "RemoteLinker";

/// Default budget for linker invocations.
const LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote instantiation service published by a communicator that accepts
/// cross-host links.
///
/// Only the port of `publish_to` travels on the wire; the receiving side
/// combines it with the connection's source host.
#[async_trait::async_trait]
pub trait RemoteLinker: Send + Sync {
    /// Instantiates `callsign`'s class on this node and publishes it back
    /// to the caller's communicator, tagged with `exchange`.
    async fn link_by_callsign(
        &self,
        publish_to: NodeAddress,
        interface: InterfaceId,
        exchange: ExchangeId,
        callsign: String,
    ) -> Result<(), ErrorCode>;

    /// Releases a previously established link.
    async fn unlink(&self, exchange: ExchangeId) -> Result<(), ErrorCode>;
}

const LINK_BY_CALLSIGN: MethodId = MethodId(0);
const UNLINK: MethodId = MethodId(1);

struct RemoteLinkerProxy {
    handle: ProxyHandle,
}

#[async_trait::async_trait]
impl RemoteLinker for RemoteLinkerProxy {
    async fn link_by_callsign(
        &self,
        publish_to: NodeAddress,
        interface: InterfaceId,
        exchange: ExchangeId,
        callsign: String,
    ) -> Result<(), ErrorCode> {
        // Cross-host publication needs a routable TCP port.
        let port = publish_to.port().ok_or(ErrorCode::IllegalState)?;

        let mut args = Frame::new();
        args.write_u16(port);
        args.write_u32(interface.0);
        args.write_u32(exchange.0);
        args.write_string(&callsign)
            .map_err(|_| ErrorCode::Serialization)?;

        self.handle.invoke(LINK_BY_CALLSIGN, args, LINK_TIMEOUT).await?;
        Ok(())
    }

    async fn unlink(&self, exchange: ExchangeId) -> Result<(), ErrorCode> {
        let mut args = Frame::new();
        args.write_u32(exchange.0);

        self.handle.invoke(UNLINK, args, LINK_TIMEOUT).await?;
        Ok(())
    }
}

struct RemoteLinkerStub;

#[async_trait::async_trait]
impl StubDispatch for RemoteLinkerStub {
    async fn dispatch(
        &self,
        context: StubContext<'_>,
        method: MethodId,
        args: Frame,
    ) -> Result<Frame, ErrorCode> {
        let implementation = context
            .object
            .downcast::<dyn RemoteLinker>()
            .ok_or(ErrorCode::RpcCallFailed)?;
        let mut reader = args.reader();

        match method {
            LINK_BY_CALLSIGN => {
                let port = reader.read_u16().map_err(|_| ErrorCode::Serialization)?;
                let interface =
                    InterfaceId(reader.read_u32().map_err(|_| ErrorCode::Serialization)?);
                let exchange =
                    ExchangeId(reader.read_u32().map_err(|_| ErrorCode::Serialization)?);
                let callsign = reader.read_string().map_err(|_| ErrorCode::Serialization)?;

                // Only the port travelled; the host is the connection's
                // source address.
                let publish_to = publish_address(context.channel.peer(), port)?;

                implementation
                    .link_by_callsign(publish_to, interface, exchange, callsign)
                    .await?;
                Ok(Frame::new())
            }
            UNLINK => {
                let exchange =
                    ExchangeId(reader.read_u32().map_err(|_| ErrorCode::Serialization)?);
                implementation.unlink(exchange).await?;
                Ok(Frame::new())
            }
            _ => Err(ErrorCode::Unavailable),
        }
    }
}

/// Combines the invoking connection's source host with the announced port.
fn publish_address(peer: &str, port: u16) -> Result<NodeAddress, ErrorCode> {
    let host = peer
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(peer)
        .trim_matches(['[', ']']);
    let is_v6 = host.contains(':');
    if host.is_empty() {
        return Err(ErrorCode::IllegalState);
    }
    Ok(NodeAddress::Tcp {
        host: host.to_owned(),
        is_v6,
        port,
    })
}

/// The registered glue for [`RemoteLinker`].
pub fn remote_linker_pair() -> ProxyStubPair {
    ProxyStubPair {
        interface_id: REMOTE_LINKER_INTERFACE,
        version: REMOTE_LINKER_VERSION,
        proxy: |handle| {
            let proxy: Arc<dyn RemoteLinker> = Arc::new(RemoteLinkerProxy {
                handle: handle.clone(),
            });
            RemoteObject::proxy::<dyn RemoteLinker>(
                REMOTE_LINKER_INTERFACE,
                REMOTE_LINKER_VERSION,
                proxy,
                &handle,
            )
        },
        stub: Arc::new(RemoteLinkerStub),
    }
}

/// Serving side of [`RemoteLinker`]: instantiates the named class from the
/// local service registry and offers it to the caller's communicator.
pub struct LinkerService {
    administrator: Arc<Administrator>,
    registry: ServiceRegistry,
    links: Mutex<HashMap<u32, Arc<CommunicatorClient>>>,
}

impl fmt::Debug for LinkerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkerService")
            .field("links", &self.links.lock().expect("poisoned").len())
            .finish()
    }
}

impl LinkerService {
    /// Returns a linker serving classes from `registry`.
    pub fn new(administrator: Arc<Administrator>, registry: ServiceRegistry) -> Arc<Self> {
        Arc::new(Self {
            administrator,
            registry,
            links: Mutex::new(HashMap::new()),
        })
    }

    /// Publishes this linker in its registry under [`REMOTE_LINKER_CLASS`]
    /// and registers the proxy/stub glue.
    pub fn publish(self: &Arc<Self>) {
        ensure_linker_factory(&self.administrator);

        let service = self.clone();
        self.registry.register(
            REMOTE_LINKER_CLASS,
            Arc::new(move |_version| {
                let linker: Arc<dyn RemoteLinker> = service.clone();
                Some(RemoteObject::new::<dyn RemoteLinker>(
                    REMOTE_LINKER_INTERFACE,
                    REMOTE_LINKER_VERSION,
                    linker,
                ))
            }),
        );
    }
}

#[async_trait::async_trait]
impl RemoteLinker for LinkerService {
    #[tracing::instrument(skip(self), fields(%exchange, %callsign))]
    async fn link_by_callsign(
        &self,
        publish_to: NodeAddress,
        interface: InterfaceId,
        exchange: ExchangeId,
        callsign: String,
    ) -> Result<(), ErrorCode> {
        let object = self
            .registry
            .instantiate(&callsign, Version::ANY)
            .ok_or(ErrorCode::Unavailable)?;
        let object = object.query_interface(interface).ok_or(ErrorCode::Unavailable)?;

        let client = Arc::new(CommunicatorClient::new(
            self.administrator.clone(),
            publish_to,
            ClientMode::Offer { object, exchange },
        ));
        client.open(LINK_TIMEOUT).await?;

        self.links.lock().expect("poisoned").insert(exchange.0, client);
        tracing::info!("link established");
        Ok(())
    }

    async fn unlink(&self, exchange: ExchangeId) -> Result<(), ErrorCode> {
        let client = self.links.lock().expect("poisoned").remove(&exchange.0);
        match client {
            Some(client) => {
                client.close().await;
                tracing::info!(%exchange, "link released");
                Ok(())
            }
            None => Err(ErrorCode::Unavailable),
        }
    }
}

fn ensure_linker_factory(administrator: &Arc<Administrator>) {
    if administrator.factory(REMOTE_LINKER_INTERFACE).is_none() {
        administrator.announce_factory(remote_linker_pair());
    }
}

/// A link to an object running on another host.
///
/// Opens a second communicator client to the remote node, asks its linker to
/// instantiate and publish the object, and keeps the connection until
/// terminated. Termination unlinks asynchronously on a worker task so the
/// caller's thread never blocks.
pub struct RemoteHost {
    client: Arc<CommunicatorClient>,
    linker: ObjectRef<dyn RemoteLinker>,
    exchange: ExchangeId,
    callsign: String,
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("callsign", &self.callsign)
            .field("exchange", &self.exchange)
            .finish()
    }
}

impl RemoteHost {
    /// Connects to `node` and asks it to instantiate `callsign`'s class,
    /// publishing the result back to `publish_to` tagged with `exchange`.
    #[tracing::instrument(skip(administrator), fields(%node, %exchange))]
    pub async fn launch(
        administrator: Arc<Administrator>,
        node: &NodeAddress,
        publish_to: NodeAddress,
        interface: InterfaceId,
        exchange: ExchangeId,
        callsign: &str,
        timeout: Duration,
    ) -> Result<Self, ErrorCode> {
        ensure_linker_factory(&administrator);

        let client = Arc::new(CommunicatorClient::new(
            administrator,
            node.clone(),
            ClientMode::Acquire {
                class_name: REMOTE_LINKER_CLASS.to_owned(),
                interface: REMOTE_LINKER_INTERFACE,
                version: REMOTE_LINKER_VERSION,
            },
        ));
        client.open(timeout).await?;

        let linker = client.root(timeout).await?;
        let linker =
            ObjectRef::<dyn RemoteLinker>::from_remote(linker).ok_or(ErrorCode::RpcCallFailed)?;

        linker
            .link_by_callsign(publish_to, interface, exchange, callsign.to_owned())
            .await?;

        Ok(Self {
            client,
            linker,
            exchange,
            callsign: callsign.to_owned(),
        })
    }

    /// The exchange id tagging the published object.
    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    /// Unlinks asynchronously and drops the connection; returns without
    /// waiting for the remote side.
    pub fn terminate(self) {
        let Self {
            client,
            linker,
            exchange,
            callsign,
        } = self;

        tokio::spawn(async move {
            if let Err(code) = linker.unlink(exchange).await {
                tracing::debug!(%code, %callsign, "unlink failed");
            }
            client.close().await;
        });
    }
}
