//! The process-wide registry of implementations, proxies and factories.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use plexus_ipc::{Channel, ChannelId, ChannelState};
use plexus_protocol::{
    AnnounceKind, ErrorCode, ExchangeId, Frame, FrameReader, Init, InstanceId, InterfaceId,
    RawInstance, Setup,
};
use tokio::sync::mpsc;

use crate::loader::LoadedLibrary;
use crate::object::{ObjectRef, Origin, RemoteObject};
use crate::proxy::{ProxyHandle, ProxyShared};
use crate::stub::ProxyStubPair;

/// Proxy lifetime operations, queued so that drop sites never block.
#[derive(Debug)]
pub(crate) enum LifetimeCommand {
    Release {
        channel: Channel,
        instance: InstanceId,
        interface: InterfaceId,
        informed: bool,
    },
}

/// One locally owned object exposed across at least one channel.
struct ImplementationRecord {
    object: RemoteObject,
    /// Outstanding counts taken on behalf of each peer channel.
    channels: HashMap<ChannelId, u32>,
}

type ProxyKey = (ChannelId, InstanceId, InterfaceId);

struct Tables {
    implementations: HashMap<InstanceId, ImplementationRecord>,
    /// (allocation identity, interface) to the wire handle already assigned.
    identities: HashMap<(usize, InterfaceId), InstanceId>,
    proxies: HashMap<ProxyKey, Weak<ProxyShared>>,
    factories: HashMap<InterfaceId, ProxyStubPair>,
    attached: HashSet<ChannelId>,
    next_instance: RawInstance,
}

impl Tables {
    fn allocate_instance(&mut self) -> InstanceId {
        let instance = InstanceId::from_raw(self.next_instance);
        self.next_instance += 1;
        instance
    }

    fn register(&mut self, channel: ChannelId, object: &RemoteObject) -> InstanceId {
        let key = (object.identity(), object.interface_id());
        if let Some(&instance) = self.identities.get(&key) {
            let record = self
                .implementations
                .get_mut(&instance)
                .expect("identity index in sync with implementations");
            *record.channels.entry(channel).or_insert(0) += 1;
            instance
        } else {
            let instance = self.allocate_instance();
            self.identities.insert(key, instance);
            self.implementations.insert(
                instance,
                ImplementationRecord {
                    object: object.clone(),
                    channels: HashMap::from([(channel, 1)]),
                },
            );
            instance
        }
    }
}

/// Outcome of feeding an inbound announce to the registry.
#[derive(Debug)]
pub enum AnnounceOutcome {
    /// A request or revoke, serviced by the registry. `Some` carries the
    /// setup to send back; revokes are fire-and-forget and carry `None`.
    Handled(Option<Setup>),

    /// An acquire or offer; endpoint policy, handed back to the caller.
    Unhandled(Init),
}

/// The process-wide registry of implementations, proxies and factories.
///
/// Create one per process, before any interface use, and keep it alive until
/// the last channel has drained. All three tables share one short-held lock;
/// no announce or invoke is ever written while it is held.
pub struct Administrator {
    // Field order is teardown order: the tables (which pin implementations
    // possibly defined in loaded libraries) must drop before the libraries
    // unload.
    state: Mutex<Tables>,
    pub(crate) libraries: Mutex<Vec<LoadedLibrary>>,
    lifetime_tx: mpsc::UnboundedSender<LifetimeCommand>,
    process_id: u32,
}

impl fmt::Debug for Administrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.state.lock().expect("poisoned");
        f.debug_struct("Administrator")
            .field("implementations", &tables.implementations.len())
            .field("proxies", &tables.proxies.len())
            .field("factories", &tables.factories.len())
            .finish()
    }
}

impl Administrator {
    /// Creates the registry and starts its lifetime worker.
    ///
    /// Must run inside a Tokio runtime.
    pub fn new() -> Arc<Self> {
        let (lifetime_tx, lifetime_rx) = mpsc::unbounded_channel();

        let administrator = Arc::new(Self {
            state: Mutex::new(Tables {
                implementations: HashMap::new(),
                identities: HashMap::new(),
                proxies: HashMap::new(),
                factories: HashMap::new(),
                attached: HashSet::new(),
                next_instance: 1,
            }),
            libraries: Mutex::new(Vec::new()),
            lifetime_tx,
            process_id: std::process::id(),
        });

        tokio::spawn(run_lifetime(Arc::downgrade(&administrator), lifetime_rx));

        administrator
    }

    /// This process's id, stamped into outgoing announces.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Registers the proxy/stub glue for one interface.
    ///
    /// Factories are write-once: a second registration for the same
    /// interface id is a no-op that logs.
    pub fn announce_factory(&self, pair: ProxyStubPair) {
        let mut tables = self.state.lock().expect("poisoned");
        if tables.factories.contains_key(&pair.interface_id) {
            tracing::warn!(interface = %pair.interface_id, "factory already registered, ignoring");
            return;
        }
        tables.factories.insert(pair.interface_id, pair);
    }

    /// Looks up the registered glue for an interface.
    pub fn factory(&self, interface: InterfaceId) -> Option<ProxyStubPair> {
        self.state
            .lock()
            .expect("poisoned")
            .factories
            .get(&interface)
            .cloned()
    }

    /// Ties a channel's lifecycle to the registry: when it closes, every
    /// count and proxy bound to it is drained. Idempotent.
    pub fn attach_channel(self: &Arc<Self>, channel: &Channel) {
        {
            let mut tables = self.state.lock().expect("poisoned");
            if !tables.attached.insert(channel.id()) {
                return;
            }
        }

        let administrator = Arc::downgrade(self);
        let id = channel.id();
        channel.on_state_change(Arc::new(move |state| {
            if state == ChannelState::Closed
                && let Some(administrator) = administrator.upgrade()
            {
                administrator.drain_channel(id);
            }
        }));

        // The observer registration raced an already-dead channel.
        if channel.state() == ChannelState::Closed {
            self.drain_channel(id);
        }
    }

    /// Exposes a local object on `channel`, taking one count on the peer's
    /// behalf, and returns the handle used on the wire.
    ///
    /// Registering the same implementation again under the same interface
    /// reuses its handle and increments the count.
    pub fn register_interface(
        self: &Arc<Self>,
        channel: &Channel,
        object: &RemoteObject,
    ) -> InstanceId {
        self.attach_channel(channel);
        self.state
            .lock()
            .expect("poisoned")
            .register(channel.id(), object)
    }

    /// Releases `count` references taken on behalf of `channel`; destroys
    /// the record when its last count is gone. Unknown handles are a no-op
    /// (revokes are idempotent).
    pub fn unregister_interface(&self, channel: ChannelId, instance: InstanceId, count: u32) {
        let mut tables = self.state.lock().expect("poisoned");
        let Some(record) = tables.implementations.get_mut(&instance) else {
            tracing::trace!(%instance, "unregister for unknown instance ignored");
            return;
        };

        if let Some(outstanding) = record.channels.get_mut(&channel) {
            *outstanding = outstanding.saturating_sub(count);
            if *outstanding == 0 {
                record.channels.remove(&channel);
            }
        }

        if record.channels.is_empty() {
            let key = (record.object.identity(), record.object.interface_id());
            tables.implementations.remove(&instance);
            tables.identities.remove(&key);
        }
    }

    /// Looks up a locally owned object by its wire handle.
    pub fn local_object(&self, instance: InstanceId) -> Option<RemoteObject> {
        self.state
            .lock()
            .expect("poisoned")
            .implementations
            .get(&instance)
            .map(|record| record.object.clone())
    }

    /// Outstanding count a specific channel holds on `instance`.
    pub fn channel_count(&self, channel: ChannelId, instance: InstanceId) -> u32 {
        self.state
            .lock()
            .expect("poisoned")
            .implementations
            .get(&instance)
            .and_then(|record| record.channels.get(&channel))
            .copied()
            .unwrap_or(0)
    }

    /// Total outstanding count on `instance` across all channels.
    pub fn total_count(&self, instance: InstanceId) -> u32 {
        self.state
            .lock()
            .expect("poisoned")
            .implementations
            .get(&instance)
            .map(|record| record.channels.values().sum())
            .unwrap_or(0)
    }

    /// State of the proxy record for a triple, if one exists.
    ///
    /// An entry whose last local reference dropped but whose revoke has not
    /// been written yet reports [`ProxyState::Revoking`]; a fresh import in
    /// that window constructs a new record.
    pub fn proxy_state(
        &self,
        channel: ChannelId,
        instance: InstanceId,
        interface: InterfaceId,
    ) -> Option<crate::ProxyState> {
        let tables = self.state.lock().expect("poisoned");
        let weak = tables.proxies.get(&(channel, instance, interface))?;
        Some(match weak.upgrade() {
            Some(shared) => ProxyHandle::from_shared(shared).state(),
            None => crate::ProxyState::Revoking,
        })
    }

    /// Number of live proxy records, for diagnostics and tests.
    pub fn live_proxies(&self) -> usize {
        self.state
            .lock()
            .expect("poisoned")
            .proxies
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }

    /// Looks up or constructs the proxy record for a triple; never yields
    /// two distinct records for the same (channel, instance, interface).
    fn proxy_entry(
        self: &Arc<Self>,
        channel: &Channel,
        instance: InstanceId,
        interface: InterfaceId,
        peer_informed: bool,
    ) -> ProxyHandle {
        self.attach_channel(channel);
        let key = (channel.id(), instance, interface);
        let mut tables = self.state.lock().expect("poisoned");
        if let Some(shared) = tables.proxies.get(&key).and_then(Weak::upgrade) {
            return ProxyHandle::from_shared(shared);
        }

        let handle = ProxyHandle::new(
            channel.clone(),
            instance,
            interface,
            peer_informed,
            Arc::downgrade(self),
            self.lifetime_tx.clone(),
        );
        tables.proxies.insert(key, handle.downgrade());
        handle
    }

    /// Looks up or constructs a proxy for a remote instance.
    ///
    /// When the record is constructed and the peer has not been informed, a
    /// single request announce is sent so the owner takes a count; later
    /// importers of the same triple wait on that round-trip instead of
    /// announcing again.
    pub async fn proxy_instance(
        self: &Arc<Self>,
        channel: &Channel,
        instance: InstanceId,
        interface: InterfaceId,
        peer_informed: bool,
        timeout: Duration,
    ) -> Result<ProxyHandle, ErrorCode> {
        if instance.is_empty() {
            return Err(ErrorCode::Unavailable);
        }

        let handle = self.proxy_entry(channel, instance, interface, peer_informed);

        let announced = handle
            .shared
            .announced
            .get_or_try_init(|| async {
                let init = Init::request(self.process_id, interface, instance, ExchangeId::NONE);
                let mut frame = Frame::new();
                init.encode(&mut frame).map_err(|_| ErrorCode::Serialization)?;

                let reply = channel.announce(frame, timeout).await?;
                let setup = Setup::decode(&mut reply.reader())
                    .map_err(|_| ErrorCode::Serialization)?;
                match setup {
                    Some(setup) if !setup.instance.is_empty() => {
                        if setup.instance != instance {
                            tracing::warn!(
                                requested = %instance,
                                returned = %setup.instance,
                                "peer renamed instance in request reply",
                            );
                        }
                        Ok(())
                    }
                    _ => Err(ErrorCode::Unavailable),
                }
            })
            .await
            .map(|_| ());

        match announced {
            Ok(()) => {
                handle.mark_remote_informed();
                Ok(handle)
            }
            Err(code) => {
                // Roll the record back unless a newer construction owns the
                // key by now.
                let key = (channel.id(), instance, interface);
                let mut tables = self.state.lock().expect("poisoned");
                let ours = tables
                    .proxies
                    .get(&key)
                    .is_some_and(|weak| match weak.upgrade() {
                        Some(shared) => Arc::ptr_eq(&shared, &handle.shared),
                        None => true,
                    });
                if ours {
                    tables.proxies.remove(&key);
                }
                Err(code)
            }
        }
    }

    /// Like [`Administrator::proxy_instance`], wrapped into the registered
    /// typed proxy for the interface.
    pub async fn proxy_object(
        self: &Arc<Self>,
        channel: &Channel,
        instance: InstanceId,
        interface: InterfaceId,
        peer_informed: bool,
        timeout: Duration,
    ) -> Result<RemoteObject, ErrorCode> {
        let factory = self.factory(interface).ok_or(ErrorCode::Unavailable)?;
        let handle = self
            .proxy_instance(channel, instance, interface, peer_informed, timeout)
            .await?;
        Ok((factory.proxy)(handle))
    }

    /// Resolves an inbound wire handle to an object, as a stub does for an
    /// interface-typed argument.
    ///
    /// A handle naming a local implementation resolves to it directly; any
    /// other handle gets a proxy with the peer already informed (the count
    /// was accounted for by the outer call, no second announce).
    pub fn resolve(
        self: &Arc<Self>,
        channel: &Channel,
        instance: InstanceId,
        interface: InterfaceId,
    ) -> Result<RemoteObject, ErrorCode> {
        if instance.is_empty() {
            return Err(ErrorCode::Unavailable);
        }

        let local = self.local_object(instance);
        if let Some(object) = local {
            // Query outside the lock; the hook is user code.
            return object
                .query_interface(interface)
                .ok_or(ErrorCode::Unavailable);
        }

        let factory = self.factory(interface).ok_or(ErrorCode::RpcCallFailed)?;
        let handle = self.proxy_entry(channel, instance, interface, true);
        Ok((factory.proxy)(handle))
    }

    /// Produces the wire handle for an outbound interface-typed argument.
    ///
    /// A proxy travelling back over its own channel keeps the owner's
    /// handle; everything else is pinned as a local exposure on this channel
    /// (one count, released when the peer revokes its transient proxy).
    pub fn outbound_instance(
        self: &Arc<Self>,
        channel: &Channel,
        object: &RemoteObject,
    ) -> Result<InstanceId, ErrorCode> {
        match object.origin() {
            Origin::Proxy {
                channel: proxy_channel,
                instance,
            } if proxy_channel == channel.id() => Ok(instance),
            _ => Ok(self.register_interface(channel, object)),
        }
    }

    /// Writes an optional interface-typed value into an argument or result
    /// frame.
    pub fn write_object(
        self: &Arc<Self>,
        channel: &Channel,
        frame: &mut Frame,
        object: Option<&RemoteObject>,
    ) -> Result<(), ErrorCode> {
        match object {
            None => {
                frame.write_instance(InstanceId::EMPTY);
                frame.write_u32(0);
            }
            Some(object) => {
                let instance = self.outbound_instance(channel, object)?;
                frame.write_instance(instance);
                frame.write_u32(object.interface_id().0);
            }
        }
        Ok(())
    }

    /// Reads an optional interface-typed value from an argument or result
    /// frame, resolving it to a typed reference.
    pub fn read_object<I>(
        self: &Arc<Self>,
        channel: &Channel,
        reader: &mut FrameReader<'_>,
    ) -> Result<Option<ObjectRef<I>>, ErrorCode>
    where
        I: ?Sized + Send + Sync + 'static,
        Arc<I>: Send + Sync + Clone,
    {
        let instance = reader.read_instance().map_err(|_| ErrorCode::Serialization)?;
        let interface = InterfaceId(reader.read_u32().map_err(|_| ErrorCode::Serialization)?);
        if instance.is_empty() {
            return Ok(None);
        }

        let resolved = self.resolve(channel, instance, interface)?;
        ObjectRef::from_remote(resolved)
            .map(Some)
            .ok_or(ErrorCode::RpcCallFailed)
    }

    /// Crosses a `QueryInterface` over the channel: asks the owner of the
    /// proxied instance for another interface on the same implementation.
    ///
    /// The owner may pin the same handle or a fresh one; either way the
    /// returned proxy reuses an existing record on a full triple match.
    pub async fn query_interface(
        self: &Arc<Self>,
        handle: &ProxyHandle,
        interface: InterfaceId,
        timeout: Duration,
    ) -> Result<RemoteObject, ErrorCode> {
        let channel = handle.channel().clone();
        let init = Init::request(self.process_id, interface, handle.instance(), ExchangeId::NONE);
        let mut frame = Frame::new();
        init.encode(&mut frame).map_err(|_| ErrorCode::Serialization)?;

        let reply = channel.announce(frame, timeout).await?;
        let setup = Setup::decode(&mut reply.reader()).map_err(|_| ErrorCode::Serialization)?;
        let Some(setup) = setup else {
            return Err(ErrorCode::Unavailable);
        };
        if setup.instance.is_empty() {
            return Err(ErrorCode::Unavailable);
        }

        // The reply already accounted one count for us on the owner's side.
        self.proxy_object(&channel, setup.instance, interface, true, timeout)
            .await
    }

    /// Feeds one inbound announce to the registry.
    ///
    /// Requests and revokes are serviced here; acquires and offers are
    /// endpoint policy and come back [`AnnounceOutcome::Unhandled`].
    pub fn handle_announce(
        self: &Arc<Self>,
        channel: &Channel,
        init: Init,
    ) -> AnnounceOutcome {
        match init.kind() {
            AnnounceKind::Request => {
                let resolved = self
                    .local_object(init.instance)
                    .and_then(|object| object.query_interface(init.interface));

                let setup = match resolved {
                    Some(resolved) => Setup {
                        instance: self.register_interface(channel, &resolved),
                        ..Setup::default()
                    },
                    None => {
                        tracing::debug!(
                            instance = %init.instance,
                            interface = %init.interface,
                            "request for unknown instance",
                        );
                        // An empty-handled setup tells the peer the instance
                        // is not available.
                        Setup::default()
                    }
                };
                AnnounceOutcome::Handled(Some(setup))
            }
            AnnounceKind::Revoke => {
                self.unregister_interface(channel.id(), init.instance, 1);
                AnnounceOutcome::Handled(None)
            }
            AnnounceKind::Acquire | AnnounceKind::Offer => AnnounceOutcome::Unhandled(init),
        }
    }

    /// Drains everything bound to a closed channel: implementation counts
    /// are released atomically and proxies are marked dead.
    fn drain_channel(&self, channel: ChannelId) {
        let mut tables = self.state.lock().expect("poisoned");
        let Tables {
            implementations,
            identities,
            proxies,
            attached,
            ..
        } = &mut *tables;

        implementations.retain(|_, record| {
            record.channels.remove(&channel);
            !record.channels.is_empty()
        });
        identities.retain(|_, instance| implementations.contains_key(instance));

        proxies.retain(|(proxy_channel, _, _), weak| {
            if *proxy_channel != channel {
                return true;
            }
            if let Some(shared) = weak.upgrade() {
                ProxyHandle::from_shared(shared).mark_dead();
            }
            false
        });

        attached.remove(&channel);
        tracing::debug!(%channel, "registry drained for closed channel");
    }
}

/// Processes queued proxy lifetime operations in order, so acquire and
/// revoke traffic keeps the per-channel FIFO.
async fn run_lifetime(
    administrator: Weak<Administrator>,
    mut lifetime_rx: mpsc::UnboundedReceiver<LifetimeCommand>,
) {
    while let Some(command) = lifetime_rx.recv().await {
        match command {
            LifetimeCommand::Release {
                channel,
                instance,
                interface,
                informed,
            } => {
                if let Some(administrator) = administrator.upgrade() {
                    let key = (channel.id(), instance, interface);
                    let mut tables = administrator.state.lock().expect("poisoned");
                    // A fresh import may own the key again by now; only the
                    // stale entry is removed.
                    if let Some(weak) = tables.proxies.get(&key)
                        && weak.upgrade().is_none()
                    {
                        tables.proxies.remove(&key);
                    }
                }

                if informed && channel.is_open() {
                    let init =
                        Init::revoke(std::process::id(), interface, instance, ExchangeId::NONE);
                    let mut frame = Frame::new();
                    if init.encode(&mut frame).is_ok()
                        && let Err(code) = channel.announce_oneway(frame).await
                    {
                        tracing::debug!(%instance, ?code, "revoke not delivered");
                    }
                }
            }
        }
    }
}
