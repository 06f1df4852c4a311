//! The connecting side: announce handshake and typed acquisition.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8Path;
use plexus_ipc::{Channel, Handlers};
use plexus_net_utils::NodeAddress;
use plexus_protocol::{
    ErrorCode, ExchangeId, Frame, Init, InstanceId, InterfaceId, Setup, Version, ANNOUNCE_LABEL,
    INVOKE_LABEL,
};
use plexus_rpc::{
    load_proxy_stubs, Administrator, AnnounceHandler, InvokeHandler, RemoteObject,
};

/// What a client announces when its channel opens.
#[derive(Clone, Debug)]
pub enum ClientMode {
    /// Connect without asking for or offering anything.
    Plain,

    /// Ask the communicator for an implementation of a named class.
    Acquire {
        /// Class to instantiate.
        class_name: String,
        /// Interface the instance must expose.
        interface: InterfaceId,
        /// Requested contract version.
        version: Version,
    },

    /// Publish a locally registered object to the communicator, routed by
    /// the exchange id a supervising parent handed down.
    Offer {
        /// The object to expose.
        object: RemoteObject,
        /// Routes the offer to the parent request; defaults to the
        /// environment's parent exchange id when `NONE`.
        exchange: ExchangeId,
    },
}

/// Client endpoint of a communicator.
///
/// `open` connects the channel, performs the announce handshake, and loads
/// any proxy-stub libraries the server points at. The handshake is the one
/// place an RPC blocks on an asynchronous event; awaiting the announce
/// response is that one-shot event.
pub struct CommunicatorClient {
    administrator: Arc<Administrator>,
    address: NodeAddress,
    mode: ClientMode,
    channel: Mutex<Option<Channel>>,
    setup: Mutex<Option<Setup>>,
}

impl fmt::Debug for CommunicatorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunicatorClient")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .finish()
    }
}

impl CommunicatorClient {
    /// Returns a closed client for `address`.
    pub fn new(administrator: Arc<Administrator>, address: NodeAddress, mode: ClientMode) -> Self {
        Self {
            administrator,
            address,
            mode,
            channel: Mutex::new(None),
            setup: Mutex::new(None),
        }
    }

    /// Opens the channel and completes the announce handshake.
    ///
    /// Returns `Ok` iff the channel opens and the announce reply arrives
    /// within the budget; everything else is
    /// [`ErrorCode::OpeningFailed`] and no proxy is created.
    #[tracing::instrument(skip(self), fields(address = %self.address))]
    pub async fn open(&self, timeout: Duration) -> Result<(), ErrorCode> {
        if self.is_open() {
            return Err(ErrorCode::IllegalState);
        }

        let mut handlers = Handlers::new();
        handlers.register(
            INVOKE_LABEL,
            Arc::new(InvokeHandler::new(self.administrator.clone())),
        );
        handlers.register(
            ANNOUNCE_LABEL,
            Arc::new(AnnounceHandler::new(self.administrator.clone())),
        );

        let channel = Channel::connect(&self.address, handlers, timeout)
            .await
            .map_err(|code| {
                tracing::debug!(%code, "connecting failed");
                ErrorCode::OpeningFailed
            })?;
        self.administrator.attach_channel(&channel);

        let init = self.announce_parameters(&channel);
        let mut frame = Frame::new();
        init.encode(&mut frame).map_err(|_| ErrorCode::Serialization)?;

        let reply = match channel.announce(frame, timeout).await {
            Ok(reply) => reply,
            Err(code) => {
                tracing::debug!(%code, "announce handshake failed");
                channel.close();
                return Err(ErrorCode::OpeningFailed);
            }
        };

        let setup = Setup::decode(&mut reply.reader()).map_err(|_| {
            channel.close();
            ErrorCode::OpeningFailed
        })?;

        if let Some(setup) = &setup {
            if !setup.proxy_stub_path.is_empty()
                && let Err(error) =
                    load_proxy_stubs(&self.administrator, Utf8Path::new(&setup.proxy_stub_path))
            {
                tracing::warn!(?error, path = %setup.proxy_stub_path, "loading proxy-stubs failed");
            }
        }

        *self.setup.lock().expect("poisoned") = setup;
        *self.channel.lock().expect("poisoned") = Some(channel);
        Ok(())
    }

    fn announce_parameters(&self, channel: &Channel) -> Init {
        let id = self.administrator.process_id();
        match &self.mode {
            ClientMode::Plain => {
                // Neither side offers anything up front.
                Init::acquire(id, "", InterfaceId::ANY, Version::ANY, ExchangeId::from_env())
            }
            ClientMode::Acquire {
                class_name,
                interface,
                version,
            } => Init::acquire(id, class_name, *interface, *version, ExchangeId::from_env()),
            ClientMode::Offer { object, exchange } => {
                let instance = self.administrator.register_interface(channel, object);
                let exchange = if *exchange == ExchangeId::NONE {
                    ExchangeId::from_env()
                } else {
                    *exchange
                };
                Init::offer(id, object.interface_id(), instance, exchange)
            }
        }
    }

    /// Whether the channel is currently open.
    pub fn is_open(&self) -> bool {
        self.channel
            .lock()
            .expect("poisoned")
            .as_ref()
            .is_some_and(Channel::is_open)
    }

    /// The open channel, if any.
    pub fn channel(&self) -> Option<Channel> {
        self.channel.lock().expect("poisoned").clone()
    }

    /// Trace configuration the server handed over in its setup reply.
    pub fn trace_categories(&self) -> Option<String> {
        self.setup
            .lock()
            .expect("poisoned")
            .as_ref()
            .map(|setup| setup.trace_categories.clone())
            .filter(|categories| !categories.is_empty())
    }

    /// The object the acquire-mode handshake produced.
    ///
    /// The server pinned the instance before replying, so the proxy needs no
    /// further announce.
    pub async fn root(&self, timeout: Duration) -> Result<RemoteObject, ErrorCode> {
        let ClientMode::Acquire { interface, .. } = &self.mode else {
            return Err(ErrorCode::IllegalState);
        };
        let channel = self.channel().ok_or(ErrorCode::IllegalState)?;

        let instance = self
            .setup
            .lock()
            .expect("poisoned")
            .as_ref()
            .map(|setup| setup.instance)
            .unwrap_or(InstanceId::EMPTY);
        if instance.is_empty() {
            return Err(ErrorCode::Unavailable);
        }

        self.administrator
            .proxy_object(&channel, instance, *interface, true, timeout)
            .await
    }

    /// Acquires a further object over the already-open channel.
    pub async fn acquire(
        &self,
        class_name: &str,
        interface: InterfaceId,
        version: Version,
        timeout: Duration,
    ) -> Result<RemoteObject, ErrorCode> {
        let channel = self.channel().ok_or(ErrorCode::IllegalState)?;

        let init = Init::acquire(
            self.administrator.process_id(),
            class_name,
            interface,
            version,
            ExchangeId::NONE,
        );
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

        self.administrator
            .proxy_object(&channel, setup.instance, interface, true, timeout)
            .await
    }

    /// Closes the channel and waits for the registry drain.
    pub async fn close(&self) {
        let channel = self.channel.lock().expect("poisoned").take();
        if let Some(channel) = channel {
            channel.close();
            channel.closed().await;
        }
        *self.setup.lock().expect("poisoned") = None;
    }
}
