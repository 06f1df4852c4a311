//! Accepting side of the channel layer.

use std::io::Result;

use plexus_net_utils::{NodeAddress, NodeListener};

use crate::channel::{Channel, Handlers};

/// Listens on a node address and wraps every accepted stream in a
/// [`Channel`] sharing one handler table.
///
/// One registered handler per message label serves every accepted channel,
/// which is what lets a fast peer announce before the accept loop gets
/// around to any per-connection bookkeeping.
#[derive(Debug)]
pub struct ChannelListener {
    listener: NodeListener,
    handlers: Handlers,
}

impl ChannelListener {
    /// Binds to `address`.
    pub async fn bind(address: &NodeAddress, handlers: Handlers) -> Result<Self> {
        Ok(Self::new(address.bind().await?, handlers))
    }

    /// Wraps an already-bound listener.
    pub fn new(listener: NodeListener, handlers: Handlers) -> Self {
        Self { listener, handlers }
    }

    /// Accepts one channel.
    pub async fn accept(&self) -> Result<Channel> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(Channel::from_stream(
            stream,
            peer.to_string(),
            self.handlers.clone(),
        ))
    }

    /// Returns the bound address, usable to connect a client.
    ///
    /// Mostly interesting for tests and for TCP listeners bound to port 0.
    pub fn local_address(&self) -> Result<NodeAddress> {
        self.listener.local_node_address()
    }
}
