//! Imported-object surrogates.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plexus_ipc::Channel;
use plexus_protocol::{
    ErrorCode, Frame, InstanceId, InterfaceId, InvokeRequest, InvokeResponse, MethodId,
};
use tokio::sync::OnceCell;

use crate::administrator::{Administrator, LifetimeCommand};

/// Lifecycle of a proxy record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProxyState {
    /// The surrogate is usable.
    Live,
    /// The last local reference dropped and the revoke is in flight.
    Revoking,
    /// The channel is gone; calls short-circuit.
    Dead,
}

pub(crate) struct ProxyShared {
    channel: Channel,
    instance: InstanceId,
    interface: InterfaceId,
    administrator: std::sync::Weak<Administrator>,
    /// Set once the peer holds a count on our behalf; controls whether drop
    /// writes a revoke.
    remote_hint: AtomicBool,
    dead: AtomicBool,
    /// Completion of the one acquire round-trip; later importers of the same
    /// triple wait here instead of announcing again.
    pub(crate) announced: OnceCell<()>,
    lifetime_tx: tokio::sync::mpsc::UnboundedSender<LifetimeCommand>,
}

impl Drop for ProxyShared {
    fn drop(&mut self) {
        // Last local reference gone: hand the revoke to the administrator's
        // lifetime queue. Nothing async may happen here.
        let _ = self.lifetime_tx.send(LifetimeCommand::Release {
            channel: self.channel.clone(),
            instance: self.instance,
            interface: self.interface,
            informed: self.remote_hint.load(Ordering::Acquire) && !self.dead.load(Ordering::Acquire),
        });
    }
}

/// Handle to a remote implementation, shared by every typed proxy wrapper
/// for one (channel, instance, interface) triple.
///
/// The local refcount is the strong count of this handle; when the last
/// clone drops, a single revoke goes out and the registry entry is removed.
#[derive(Clone)]
pub struct ProxyHandle {
    pub(crate) shared: Arc<ProxyShared>,
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("channel", &self.shared.channel.id())
            .field("instance", &self.shared.instance)
            .field("interface", &self.shared.interface)
            .field("state", &self.state())
            .finish()
    }
}

impl ProxyHandle {
    pub(crate) fn new(
        channel: Channel,
        instance: InstanceId,
        interface: InterfaceId,
        peer_informed: bool,
        administrator: std::sync::Weak<Administrator>,
        lifetime_tx: tokio::sync::mpsc::UnboundedSender<LifetimeCommand>,
    ) -> Self {
        let shared = Arc::new(ProxyShared {
            channel,
            instance,
            interface,
            administrator,
            remote_hint: AtomicBool::new(peer_informed),
            dead: AtomicBool::new(false),
            announced: OnceCell::new(),
            lifetime_tx,
        });
        if peer_informed {
            // The count was accounted for by whoever relayed the handle; no
            // announce round-trip is owed.
            shared.announced.set(()).expect("fresh cell");
        }
        Self { shared }
    }

    /// The channel this proxy is bound to.
    pub fn channel(&self) -> &Channel {
        &self.shared.channel
    }

    /// The implementation's handle in the owner's registry.
    pub fn instance(&self) -> InstanceId {
        self.shared.instance
    }

    /// The interface this proxy speaks.
    pub fn interface(&self) -> InterfaceId {
        self.shared.interface
    }

    /// The registry this proxy was minted by, while it is still alive.
    ///
    /// Generated proxies use it to marshal interface-typed arguments.
    pub fn administrator(&self) -> Option<Arc<Administrator>> {
        self.shared.administrator.upgrade()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProxyState {
        if self.shared.dead.load(Ordering::Acquire) {
            ProxyState::Dead
        } else {
            ProxyState::Live
        }
    }

    pub(crate) fn mark_dead(&self) {
        self.shared.dead.store(true, Ordering::Release);
    }

    pub(crate) fn mark_remote_informed(&self) {
        self.shared.remote_hint.store(true, Ordering::Release);
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ProxyShared> {
        Arc::downgrade(&self.shared)
    }

    /// Performs one method invocation against the remote implementation.
    ///
    /// Marshalled calls on a dead proxy short-circuit to
    /// [`ErrorCode::Unavailable`]; a close racing an in-flight call surfaces
    /// as [`ErrorCode::ChannelClosed`]. A timeout leaves the proxy live and
    /// the request running on the peer.
    pub async fn invoke(
        &self,
        method: MethodId,
        args: Frame,
        timeout: Duration,
    ) -> Result<Frame, ErrorCode> {
        if self.state() == ProxyState::Dead {
            return Err(ErrorCode::Unavailable);
        }

        let request = InvokeRequest {
            instance: self.shared.instance,
            interface: self.shared.interface,
            method,
            args,
        };
        let mut payload = Frame::new();
        request.encode(&mut payload);

        let response = self.shared.channel.invoke(payload, timeout).await?;
        let response = InvokeResponse::decode(&mut response.reader())
            .map_err(|_| ErrorCode::Serialization)?;
        response.code.into_result()?;
        Ok(response.result)
    }
}

impl ProxyHandle {
    pub(crate) fn from_shared(shared: Arc<ProxyShared>) -> Self {
        Self { shared }
    }
}
