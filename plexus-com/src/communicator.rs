//! The communicator server: accepts channels, services announces, and
//! bootstraps objects in-process, out-of-process or on another host.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use camino::Utf8PathBuf;
use futures::stream::StreamExt;
use plexus_ipc::{
    Channel, ChannelId, ChannelListener, ChannelState, Handlers, InboundHandler,
};
use plexus_net_utils::NodeAddress;
use plexus_protocol::{
    AnnounceKind, ConnectionId, ExchangeId, Frame, Init, InstanceId, InterfaceId, Setup,
    ANNOUNCE_LABEL, INVOKE_LABEL,
};
use plexus_rpc::{Administrator, AnnounceOutcome, InvokeHandler};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionLifecycle, RemoteConnection};
use crate::linker::RemoteHost;
use crate::process::{Process, ProcessConfig, ShutdownSchedule, ANNOUNCE_TIMEOUT};
use crate::registry::ServiceRegistry;

/// Static configuration of a [`Communicator`].
#[derive(Clone, Debug)]
pub struct CommunicatorConfig {
    /// Directory of proxy-stub libraries, advertised to every announcing
    /// client via the setup reply.
    pub proxy_stub_path: Option<Utf8PathBuf>,
    /// Default trace configuration handed to announcing clients.
    pub trace_categories: String,
    /// Budget for internal announce round-trips (relays, offers).
    pub announce_timeout: Duration,
    /// How long a launched child gets to come back with its offer.
    pub launch_timeout: Duration,
    /// Kill escalation stage durations for launched children.
    pub shutdown: ShutdownSchedule,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            proxy_stub_path: None,
            trace_categories: String::new(),
            announce_timeout: Duration::from_secs(5),
            launch_timeout: ANNOUNCE_TIMEOUT,
            shutdown: ShutdownSchedule::default(),
        }
    }
}

/// Where the implementation of a class lives when it is not registered
/// in-process.
#[derive(Clone, Debug)]
pub enum HostingMode {
    /// Launch a supervised child process hosting the class.
    OutOfProcess(ProcessConfig),
    /// Forward to a communicator on another node.
    Distributed {
        /// The remote node's communicator address.
        node: NodeAddress,
    },
}

/// An object offered by a peer, routed back to whoever requested it.
#[derive(Debug)]
struct OfferedObject {
    channel: Channel,
    instance: InstanceId,
    interface: InterfaceId,
}

struct Inner {
    administrator: Arc<Administrator>,
    registry: ServiceRegistry,
    config: CommunicatorConfig,
    /// The address this communicator is reachable at; children and remote
    /// hosts publish their offers back here.
    connector: NodeAddress,
    modes: Mutex<HashMap<String, HostingMode>>,
    connections: Mutex<HashMap<ConnectionId, Arc<RemoteConnection>>>,
    by_channel: Mutex<HashMap<ChannelId, ConnectionId>>,
    next_connection: AtomicU32,
    next_exchange: AtomicU32,
    pending_offers: Mutex<HashMap<u32, oneshot::Sender<OfferedObject>>>,
    /// Processes launched for a pending acquire, parked until the child's
    /// offer names its connection.
    pending_processes: Mutex<HashMap<u32, Process>>,
    /// Live links to other hosts, keyed by exchange id.
    remote_hosts: Mutex<HashMap<u32, RemoteHost>>,
    shutdown: CancellationToken,
}

/// Owns a listening endpoint and an administrator; the server side of the
/// runtime.
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("connector", &self.inner.connector)
            .field(
                "connections",
                &self.inner.connections.lock().expect("poisoned").len(),
            )
            .finish()
    }
}

impl Communicator {
    /// Binds the listening endpoint and starts accepting channels.
    pub async fn open(
        administrator: Arc<Administrator>,
        registry: ServiceRegistry,
        connector: &NodeAddress,
        config: CommunicatorConfig,
    ) -> std::io::Result<Self> {
        // Bind first so port-0 addresses learn their real port; children and
        // remote hosts are told to publish back to the bound address.
        let listener = connector.bind().await?;
        let connector = listener.local_node_address()?;

        let inner = Arc::new(Inner {
            administrator: administrator.clone(),
            registry,
            config,
            connector,
            modes: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            by_channel: Mutex::new(HashMap::new()),
            next_connection: AtomicU32::new(1),
            next_exchange: AtomicU32::new(1),
            pending_offers: Mutex::new(HashMap::new()),
            pending_processes: Mutex::new(HashMap::new()),
            remote_hosts: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        let mut handlers = Handlers::new();
        handlers.register(INVOKE_LABEL, Arc::new(InvokeHandler::new(administrator)));
        handlers.register(
            ANNOUNCE_LABEL,
            Arc::new(ServerAnnounceHandler {
                inner: Arc::downgrade(&inner),
            }),
        );

        let listener = ChannelListener::new(listener, handlers);
        tokio::spawn(accept_loop(inner.clone(), listener));

        Ok(Self { inner })
    }

    /// The process registry this communicator dispatches through.
    pub fn administrator(&self) -> &Arc<Administrator> {
        &self.inner.administrator
    }

    /// The in-process service registry.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// The address this communicator listens on.
    pub fn connector(&self) -> &NodeAddress {
        &self.inner.connector
    }

    /// Declares `class_name` to be hosted by a supervised child process.
    pub fn register_process(&self, class_name: impl Into<String>, config: ProcessConfig) {
        self.inner
            .modes
            .lock()
            .expect("poisoned")
            .insert(class_name.into(), HostingMode::OutOfProcess(config));
    }

    /// Declares `class_name` to be hosted on another node.
    pub fn register_remote(&self, class_name: impl Into<String>, node: NodeAddress) {
        self.inner
            .modes
            .lock()
            .expect("poisoned")
            .insert(class_name.into(), HostingMode::Distributed { node });
    }

    /// Looks up a live connection.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<RemoteConnection>> {
        self.inner.connections.lock().expect("poisoned").get(&id).cloned()
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<RemoteConnection>> {
        self.inner
            .connections
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Deterministic teardown: stop the listener, terminate connections,
    /// drop host links. Registry drain follows from the channel closes.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let connections: Vec<_> = {
            let mut connections = self.inner.connections.lock().expect("poisoned");
            connections.drain().map(|(_, connection)| connection).collect()
        };
        self.inner.by_channel.lock().expect("poisoned").clear();

        let hosts: Vec<_> = {
            let mut hosts = self.inner.remote_hosts.lock().expect("poisoned");
            hosts.drain().map(|(_, host)| host).collect()
        };
        for host in hosts {
            host.terminate();
        }

        futures::stream::iter(connections)
            .for_each_concurrent(None, async |connection| {
                connection.terminate();
                connection.channel().closed().await;
            })
            .await;
    }
}

/// Accepts channels until shutdown, wiring each into the connection map.
async fn accept_loop(inner: Arc<Inner>, listener: ChannelListener) {
    tracing::info!(connector = %inner.connector, "listening");
    loop {
        let channel = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(channel) => channel,
                Err(error) => {
                    tracing::error!(?error, "accepting channel failed");
                    continue;
                }
            },
        };

        inner.administrator.attach_channel(&channel);

        let id = ConnectionId(inner.next_connection.fetch_add(1, Ordering::Relaxed));
        let connection = RemoteConnection::new(
            id,
            channel.clone(),
            inner.administrator.clone(),
            inner.config.shutdown,
        );

        inner
            .connections
            .lock()
            .expect("poisoned")
            .insert(id, connection.clone());
        inner
            .by_channel
            .lock()
            .expect("poisoned")
            .insert(channel.id(), id);

        tracing::info!(connection = %id, peer = %channel.peer(), "channel accepted");

        // Connection entries leave the maps when their channel dies.
        let weak = Arc::downgrade(&inner);
        let channel_id = channel.id();
        channel.on_state_change(Arc::new(move |state| {
            if state == ChannelState::Closed
                && let Some(inner) = weak.upgrade()
            {
                remove_connection(&inner, channel_id);
            }
        }));
        // The observer registration raced an already-dead channel.
        if channel.state() == ChannelState::Closed {
            remove_connection(&inner, channel_id);
        }
    }
}

fn remove_connection(inner: &Inner, channel: ChannelId) {
    let Some(id) = inner.by_channel.lock().expect("poisoned").remove(&channel) else {
        return;
    };
    if let Some(connection) = inner.connections.lock().expect("poisoned").remove(&id) {
        connection.set_lifecycle(ConnectionLifecycle::Dead);
        tracing::info!(connection = %id, "connection closed");
    }
}

/// The announce-label server of a communicator.
struct ServerAnnounceHandler {
    inner: Weak<Inner>,
}

#[async_trait::async_trait]
impl InboundHandler for ServerAnnounceHandler {
    async fn handle(&self, channel: Channel, payload: Frame) -> Option<Frame> {
        let inner = self.inner.upgrade()?;

        let init = match Init::decode(&mut payload.reader()) {
            Ok(init) => init,
            Err(error) => {
                tracing::warn!(channel = %channel.id(), ?error, "undecodable announce");
                return None;
            }
        };

        if let Some(connection) = inner.connection_for_settled(&channel).await {
            if connection.lifecycle() == ConnectionLifecycle::Constructed {
                connection.set_lifecycle(ConnectionLifecycle::Announced);
            }
            connection.set_process_id(init.id);
        }

        match inner.administrator.handle_announce(&channel, init) {
            AnnounceOutcome::Handled(Some(setup)) => {
                let mut frame = Frame::new();
                setup.encode(&mut frame).ok()?;
                Some(frame)
            }
            AnnounceOutcome::Handled(None) => None,
            AnnounceOutcome::Unhandled(init) => match init.kind() {
                AnnounceKind::Acquire => {
                    let setup = inner.resolve_acquire(&channel, &init).await;
                    let mut frame = Frame::new();
                    setup.encode(&mut frame).ok()?;
                    Some(frame)
                }
                AnnounceKind::Offer => {
                    inner.accept_offer(&channel, &init);
                    // Accepted; nothing offered back.
                    Some(Frame::new())
                }
                _ => Some(Frame::new()),
            },
        }
    }
}

impl Inner {
    fn connection_for(&self, channel: &Channel) -> Option<Arc<RemoteConnection>> {
        let id = *self.by_channel.lock().expect("poisoned").get(&channel.id())?;
        self.connections.lock().expect("poisoned").get(&id).cloned()
    }

    /// Like [`Inner::connection_for`], but rides out the window between a
    /// channel starting to dispatch and the accept loop finishing its
    /// bookkeeping.
    async fn connection_for_settled(&self, channel: &Channel) -> Option<Arc<RemoteConnection>> {
        for _ in 0..100 {
            if let Some(connection) = self.connection_for(channel) {
                return Some(connection);
            }
            if !channel.is_open() {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    fn allocate_exchange(&self) -> u32 {
        self.next_exchange.fetch_add(1, Ordering::Relaxed)
    }

    fn setup(&self, instance: InstanceId) -> Setup {
        Setup {
            instance,
            proxy_stub_path: self
                .config
                .proxy_stub_path
                .as_ref()
                .map(|path| path.to_string())
                .unwrap_or_default(),
            trace_categories: self.config.trace_categories.clone(),
        }
    }

    /// Resolves an acquire through the three hosting paths; an empty-handed
    /// setup means the class is not available.
    #[tracing::instrument(skip_all, fields(class = init.class_name(), interface = %init.interface))]
    async fn resolve_acquire(self: &Arc<Self>, channel: &Channel, init: &Init) -> Setup {
        // In-process: the service registry instantiates directly.
        if let Some(object) = self.registry.instantiate(init.class_name(), init.version) {
            let Some(object) = object.query_interface(init.interface) else {
                tracing::warn!("class does not expose the requested interface");
                return self.setup(InstanceId::EMPTY);
            };
            let instance = self.administrator.register_interface(channel, &object);
            self.mark_active(channel);
            tracing::info!(%instance, "acquire resolved in-process");
            return self.setup(instance);
        }

        let mode = self
            .modes
            .lock()
            .expect("poisoned")
            .get(init.class_name())
            .cloned();

        match mode {
            Some(HostingMode::OutOfProcess(config)) => {
                self.resolve_out_of_process(channel, init, config).await
            }
            Some(HostingMode::Distributed { node }) => {
                self.resolve_distributed(channel, init, node).await
            }
            None => {
                tracing::debug!("unknown class");
                self.setup(InstanceId::EMPTY)
            }
        }
    }

    /// Launches a supervised child and waits for it to offer the object
    /// back on its own channel, then relays the offer to the caller.
    async fn resolve_out_of_process(
        self: &Arc<Self>,
        channel: &Channel,
        init: &Init,
        mut config: ProcessConfig,
    ) -> Setup {
        config.interface = init.interface;
        if config.proxy_stub_path.is_none() {
            config.proxy_stub_path = self.config.proxy_stub_path.clone();
        }

        let exchange = self.allocate_exchange();
        let (offer_tx, offer_rx) = oneshot::channel();
        self.pending_offers
            .lock()
            .expect("poisoned")
            .insert(exchange, offer_tx);

        let process = match Process::launch(&config, &self.connector, ExchangeId(exchange)) {
            Ok(process) => process,
            Err(code) => {
                self.pending_offers.lock().expect("poisoned").remove(&exchange);
                tracing::error!(%code, "child launch failed");
                return self.setup(InstanceId::EMPTY);
            }
        };
        self.pending_processes
            .lock()
            .expect("poisoned")
            .insert(exchange, process);

        let offered = tokio::time::timeout(self.config.launch_timeout, offer_rx).await;
        match offered {
            Ok(Ok(offered)) => self.relay_offer(channel, offered).await,
            _ => {
                tracing::error!("child never offered its object");
                self.pending_offers.lock().expect("poisoned").remove(&exchange);
                if let Some(process) =
                    self.pending_processes.lock().expect("poisoned").remove(&exchange)
                {
                    process.terminate(self.config.shutdown);
                }
                self.setup(InstanceId::EMPTY)
            }
        }
    }

    /// Asks the remote node to instantiate and publish the class, then
    /// relays its offer like a local child's.
    async fn resolve_distributed(
        self: &Arc<Self>,
        channel: &Channel,
        init: &Init,
        node: NodeAddress,
    ) -> Setup {
        let exchange = self.allocate_exchange();
        let (offer_tx, offer_rx) = oneshot::channel();
        self.pending_offers
            .lock()
            .expect("poisoned")
            .insert(exchange, offer_tx);

        let host = RemoteHost::launch(
            self.administrator.clone(),
            &node,
            self.connector.clone(),
            init.interface,
            ExchangeId(exchange),
            init.class_name(),
            self.config.announce_timeout,
        )
        .await;

        let host = match host {
            Ok(host) => host,
            Err(code) => {
                self.pending_offers.lock().expect("poisoned").remove(&exchange);
                tracing::error!(%code, %node, "remote link failed");
                return self.setup(InstanceId::EMPTY);
            }
        };
        self.remote_hosts.lock().expect("poisoned").insert(exchange, host);

        let offered = tokio::time::timeout(self.config.launch_timeout, offer_rx).await;
        match offered {
            Ok(Ok(offered)) => self.relay_offer(channel, offered).await,
            _ => {
                tracing::error!("remote host never offered its object");
                self.pending_offers.lock().expect("poisoned").remove(&exchange);
                if let Some(host) = self.remote_hosts.lock().expect("poisoned").remove(&exchange) {
                    host.terminate();
                }
                self.setup(InstanceId::EMPTY)
            }
        }
    }

    /// Imports an offered object from its owner's channel and re-exposes it
    /// on the caller's channel; invokes relay through this process.
    async fn relay_offer(self: &Arc<Self>, caller: &Channel, offered: OfferedObject) -> Setup {
        let proxy = self
            .administrator
            .proxy_object(
                &offered.channel,
                offered.instance,
                offered.interface,
                true,
                self.config.announce_timeout,
            )
            .await;

        match proxy {
            Ok(proxy) => {
                let instance = self.administrator.register_interface(caller, &proxy);
                self.mark_active(caller);
                tracing::info!(%instance, "acquire resolved via offer relay");
                self.setup(instance)
            }
            Err(code) => {
                tracing::error!(%code, "importing offered object failed");
                self.setup(InstanceId::EMPTY)
            }
        }
    }

    /// Routes an inbound offer to the acquire waiting on its exchange id,
    /// or parks it on the connection.
    fn accept_offer(self: &Arc<Self>, channel: &Channel, init: &Init) {
        if let Some(connection) = self.connection_for(channel) {
            connection.set_offered(init.instance, init.interface);
            if let Some(process) = self
                .pending_processes
                .lock()
                .expect("poisoned")
                .remove(&init.exchange.0)
            {
                connection.set_callsign(process.callsign());
                connection.attach_process(process);
            }
            connection.set_lifecycle(ConnectionLifecycle::Active);
        }

        let waiter = self
            .pending_offers
            .lock()
            .expect("poisoned")
            .remove(&init.exchange.0);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(OfferedObject {
                    channel: channel.clone(),
                    instance: init.instance,
                    interface: init.interface,
                });
            }
            None => {
                tracing::debug!(
                    exchange = %init.exchange,
                    instance = %init.instance,
                    "offer without a pending acquire",
                );
            }
        }
    }

    fn mark_active(&self, channel: &Channel) {
        if let Some(connection) = self.connection_for(channel) {
            connection.set_lifecycle(ConnectionLifecycle::Active);
        }
    }
}
