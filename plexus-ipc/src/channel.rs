//! The channel actor: one task owning the framed stream, a correlation map
//! for outstanding requests, and the inbound dispatch path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::sink::SinkExt;
use futures::stream::StreamExt;
use plexus_net_utils::{NodeAddress, NodeStream};
use plexus_protocol::{Codec, Envelope, ErrorCode, Frame, ANNOUNCE_LABEL, INVOKE_LABEL};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

// 16 arbitrarily chosen for channel sizing because it looks nice.
const OUTBOUND_BUFFER: usize = 16;

// Upper bound on concurrently dispatching inbound requests per channel; keeps
// a misbehaving peer from exhausting the task budget.
const DISPATCH_WORKERS: usize = 8;

/// Lifecycle of a [`Channel`].
///
/// Only `Open` channels accept invokes; `Closed` is terminal for a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// No transport attached.
    Closed,
    /// Transport being established.
    Opening,
    /// Messages flowing.
    Open,
    /// Shutdown initiated by either side.
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(text)
    }
}

/// Process-unique identity of a channel, used as a registry key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Observer invoked on every state transition.
///
/// Observers run on the channel task and must not block.
pub type StateObserver = Arc<dyn Fn(ChannelState) + Send + Sync>;

/// Receiver side of one message label.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Handles one inbound request payload.
    ///
    /// Returning `Some` writes a response envelope correlated with the
    /// request; `None` leaves the request unanswered (fire-and-forget
    /// senders expect exactly that).
    async fn handle(&self, channel: Channel, payload: Frame) -> Option<Frame>;
}

/// Per-endpoint table of inbound handlers, one per message label.
#[derive(Clone, Default)]
pub struct Handlers {
    table: HashMap<u8, Arc<dyn InboundHandler>>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("labels", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Handlers {
    /// Returns an empty handler table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `label`.
    ///
    /// The first registration wins; a duplicate is a no-op that logs.
    pub fn register(&mut self, label: u8, handler: Arc<dyn InboundHandler>) {
        if self.table.contains_key(&label) {
            tracing::warn!(label, "handler already registered, ignoring duplicate");
            return;
        }
        self.table.insert(label, handler);
    }

    fn get(&self, label: u8) -> Option<Arc<dyn InboundHandler>> {
        self.table.get(&label).cloned()
    }
}

struct Inner {
    id: ChannelId,
    peer: String,
    state_tx: watch::Sender<ChannelState>,
    observers: Mutex<Vec<StateObserver>>,
    outbound_tx: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Envelope>>>,
    next_ordinal: AtomicU32,
    handlers: Handlers,
    shutdown: CancellationToken,
    // Held between construction and `start`, when the actor takes it.
    outbound_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

impl Inner {
    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        if self.state() == state {
            return;
        }
        self.state_tx.send_replace(state);
        for observer in self.observers.lock().expect("poisoned").iter() {
            observer(state);
        }
    }

    /// Fails every outstanding request; their oneshot receivers observe the
    /// drop as `ChannelClosed`.
    fn drain_pending(&self) {
        self.pending.lock().expect("poisoned").clear();
    }
}

/// A bidirectional message pipe to one peer process.
///
/// Cloning shares the same underlying session.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Channel {
    /// Connects to `address` and starts the channel actor.
    ///
    /// The returned channel is `Open`; observers registered through
    /// [`Handlers`] see every later transition.
    pub async fn connect(
        address: &NodeAddress,
        handlers: Handlers,
        timeout: Duration,
    ) -> Result<Self, ErrorCode> {
        let (channel, stream) = match tokio::time::timeout(timeout, address.connect()).await {
            Err(_) => return Err(ErrorCode::Timeout),
            Ok(Err(error)) => {
                tracing::debug!(%address, ?error, "connecting to peer failed");
                return Err(ErrorCode::Unavailable);
            }
            Ok(Ok(stream)) => (Self::new(address.to_string(), handlers), stream),
        };

        channel.start(stream);
        Ok(channel)
    }

    /// Wraps an accepted stream and starts the channel actor.
    pub fn from_stream(stream: NodeStream, peer: String, handlers: Handlers) -> Self {
        let channel = Self::new(peer, handlers);
        channel.start(stream);
        channel
    }

    fn new(peer: String, handlers: Handlers) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Opening);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

        Self {
            inner: Arc::new(Inner {
                id: ChannelId::next(),
                peer,
                state_tx,
                observers: Mutex::new(Vec::new()),
                outbound_tx,
                pending: Mutex::new(HashMap::new()),
                next_ordinal: AtomicU32::new(1),
                handlers,
                shutdown: CancellationToken::new(),
                outbound_rx: Mutex::new(Some(outbound_rx)),
            }),
        }
    }

    fn start(&self, stream: NodeStream) {
        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .expect("poisoned")
            .take()
            .expect("channel started twice");
        self.inner.set_state(ChannelState::Open);
        tokio::spawn(run(self.clone(), stream, outbound_rx));
    }

    /// Process-unique identity of this channel.
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Human-readable peer designation, for diagnostics.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Whether the channel currently accepts invokes.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Returns a watch of the lifecycle state.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    /// Registers an observer for every state transition.
    ///
    /// Observers run on the channel task and must not block.
    pub fn on_state_change(&self, observer: StateObserver) {
        self.inner.observers.lock().expect("poisoned").push(observer);
    }

    /// Sends an invoke request and awaits its correlated response.
    pub async fn invoke(&self, payload: Frame, timeout: Duration) -> Result<Frame, ErrorCode> {
        self.request(INVOKE_LABEL, payload, timeout).await
    }

    /// Sends an announce request and awaits its correlated response.
    pub async fn announce(&self, payload: Frame, timeout: Duration) -> Result<Frame, ErrorCode> {
        self.request(ANNOUNCE_LABEL, payload, timeout).await
    }

    /// Sends an announce without awaiting any response (revokes).
    pub async fn announce_oneway(&self, payload: Frame) -> Result<(), ErrorCode> {
        if !self.is_open() {
            return Err(ErrorCode::ChannelClosed);
        }
        let ordinal = self.inner.next_ordinal.fetch_add(1, Ordering::Relaxed);
        self.inner
            .outbound_tx
            .send(Envelope::request(ANNOUNCE_LABEL, ordinal, payload))
            .await
            .map_err(|_| ErrorCode::ChannelClosed)
    }

    async fn request(
        &self,
        label: u8,
        payload: Frame,
        timeout: Duration,
    ) -> Result<Frame, ErrorCode> {
        if !self.is_open() {
            return Err(ErrorCode::ChannelClosed);
        }
        if payload.len() > usize::from(u16::MAX) - 5 {
            return Err(ErrorCode::Serialization);
        }

        let ordinal = self.inner.next_ordinal.fetch_add(1, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("poisoned")
            .insert(ordinal, response_tx);

        if self
            .inner
            .outbound_tx
            .send(Envelope::request(label, ordinal, payload))
            .await
            .is_err()
        {
            self.inner.pending.lock().expect("poisoned").remove(&ordinal);
            return Err(ErrorCode::ChannelClosed);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(envelope)) => Ok(envelope.payload),
            // The actor dropped the sender: the channel went down while the
            // request was outstanding.
            Ok(Err(_)) => Err(ErrorCode::ChannelClosed),
            Err(_) => {
                // The request stays live on the peer; only the local waiter
                // gives up. A response arriving later is discarded.
                self.inner.pending.lock().expect("poisoned").remove(&ordinal);
                Err(ErrorCode::Timeout)
            }
        }
    }

    /// Closes the channel, failing all outstanding requests.
    ///
    /// Idempotent; observers see `Closing` then `Closed`.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Completes once the channel reaches `Closed`.
    pub async fn closed(&self) {
        let mut state_rx = self.subscribe();
        while *state_rx.borrow_and_update() != ChannelState::Closed {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The channel actor: owns the framed stream, multiplexes outbound requests
/// and responses, and routes inbound traffic.
async fn run(channel: Channel, stream: NodeStream, mut outbound_rx: mpsc::Receiver<Envelope>) {
    let inner = channel.inner.clone();
    let mut framed = Framed::new(stream, Codec::new());
    let dispatch_limit = Arc::new(Semaphore::new(DISPATCH_WORKERS));
    let (response_tx, mut response_rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                inner.set_state(ChannelState::Closing);
                let _ = framed.flush().await;
                break;
            }
            outgoing = outbound_rx.recv() => {
                let Some(envelope) = outgoing else { break };
                if let Err(error) = framed.send(envelope).await {
                    tracing::debug!(channel = %inner.id, ?error, "writing to peer failed");
                    inner.set_state(ChannelState::Closing);
                    break;
                }
            }
            response = response_rx.recv() => {
                let Some(envelope) = response else { break };
                if let Err(error) = framed.send(envelope).await {
                    tracing::debug!(channel = %inner.id, ?error, "writing response failed");
                    inner.set_state(ChannelState::Closing);
                    break;
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(envelope)) => {
                        dispatch(&channel, envelope, &dispatch_limit, &response_tx);
                    }
                    Some(Err(error)) => {
                        tracing::debug!(channel = %inner.id, ?error, "reading from peer failed");
                        inner.set_state(ChannelState::Closing);
                        break;
                    }
                    None => {
                        inner.set_state(ChannelState::Closing);
                        break;
                    }
                }
            }
        }
    }

    inner.drain_pending();
    inner.set_state(ChannelState::Closed);
    tracing::debug!(channel = %inner.id, peer = %inner.peer, "channel closed");
}

/// Routes one inbound envelope: responses complete their pending request,
/// requests go to the label's handler on a bounded worker.
fn dispatch(
    channel: &Channel,
    envelope: Envelope,
    dispatch_limit: &Arc<Semaphore>,
    response_tx: &mpsc::Sender<Envelope>,
) {
    let inner = &channel.inner;

    if envelope.is_response() {
        let waiter = inner
            .pending
            .lock()
            .expect("poisoned")
            .remove(&envelope.ordinal());
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(envelope);
            }
            None => {
                // The caller gave up (timeout) or never existed.
                tracing::trace!(
                    channel = %inner.id,
                    ordinal = envelope.ordinal(),
                    "discarding unexpected response",
                );
            }
        }
        return;
    }

    let label = envelope.label();
    let Some(handler) = inner.handlers.get(label) else {
        tracing::warn!(channel = %inner.id, label, "no handler registered for label");
        return;
    };

    let channel = channel.clone();
    let dispatch_limit = dispatch_limit.clone();
    let response_tx = response_tx.clone();
    tokio::spawn(async move {
        let Ok(_permit) = dispatch_limit.acquire_owned().await else {
            return;
        };
        let ordinal = envelope.ordinal();
        if let Some(payload) = handler.handle(channel, envelope.payload).await {
            let _ = response_tx
                .send(Envelope::response(label, ordinal, payload))
                .await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelListener;
    use std::str::FromStr;

    /// Answers every invoke by echoing the payload back.
    struct Echo;

    #[async_trait::async_trait]
    impl InboundHandler for Echo {
        async fn handle(&self, _channel: Channel, payload: Frame) -> Option<Frame> {
            Some(payload)
        }
    }

    /// Sleeps before echoing, to exercise invoke timeouts.
    struct SlowEcho(Duration);

    #[async_trait::async_trait]
    impl InboundHandler for SlowEcho {
        async fn handle(&self, _channel: Channel, payload: Frame) -> Option<Frame> {
            tokio::time::sleep(self.0).await;
            Some(payload)
        }
    }

    async fn loopback(server_handlers: Handlers) -> (Channel, Channel) {
        let address = NodeAddress::from_str("127.0.0.1:0").unwrap();
        let listener = ChannelListener::bind(&address, server_handlers).await.unwrap();
        let address = listener.local_address().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = Channel::connect(&address, Handlers::new(), Duration::from_secs(1))
            .await
            .unwrap();
        let server = accept.await.unwrap();
        (client, server)
    }

    fn payload(value: u32) -> Frame {
        let mut frame = Frame::new();
        frame.write_u32(value);
        frame
    }

    #[tokio::test]
    async fn invoke_round_trip() {
        let mut handlers = Handlers::new();
        handlers.register(INVOKE_LABEL, Arc::new(Echo));
        let (client, _server) = loopback(handlers).await;

        let response = client
            .invoke(payload(42), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.reader().read_u32().unwrap(), 42);
    }

    #[tokio::test]
    async fn concurrent_invokes_correlate() {
        let mut handlers = Handlers::new();
        handlers.register(INVOKE_LABEL, Arc::new(Echo));
        let (client, _server) = loopback(handlers).await;

        let calls: Vec<_> = (0..20u32)
            .map(|value| {
                let client = client.clone();
                tokio::spawn(async move {
                    client
                        .invoke(payload(value), Duration::from_secs(1))
                        .await
                        .unwrap()
                        .reader()
                        .read_u32()
                        .unwrap()
                })
            })
            .collect();

        for (value, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap(), value as u32);
        }
    }

    #[tokio::test]
    async fn timeout_leaves_channel_usable() {
        let mut handlers = Handlers::new();
        handlers.register(INVOKE_LABEL, Arc::new(SlowEcho(Duration::from_millis(500))));
        let (client, _server) = loopback(handlers).await;

        let result = client.invoke(payload(1), Duration::from_millis(100)).await;
        assert_eq!(result.unwrap_err(), ErrorCode::Timeout);
        assert!(client.is_open());

        // The late response for the first call is discarded; a fresh call
        // still succeeds.
        let response = client
            .invoke(payload(2), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.reader().read_u32().unwrap(), 2);
    }

    #[tokio::test]
    async fn close_fails_pending_and_later_invokes() {
        let mut handlers = Handlers::new();
        handlers.register(INVOKE_LABEL, Arc::new(SlowEcho(Duration::from_secs(10))));
        let (client, server) = loopback(handlers).await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.invoke(payload(1), Duration::from_secs(10)).await })
        };
        // Let the request hit the wire before tearing the peer down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();
        server.closed().await;

        assert_eq!(pending.await.unwrap().unwrap_err(), ErrorCode::ChannelClosed);

        client.closed().await;
        assert_eq!(
            client.invoke(payload(2), Duration::from_secs(1)).await.unwrap_err(),
            ErrorCode::ChannelClosed,
        );
    }

    #[tokio::test]
    async fn state_observers_see_transitions() {
        let (client, _server) = loopback(Handlers::new()).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        client.on_state_change({
            let seen = seen.clone();
            Arc::new(move |state| seen.lock().unwrap().push(state))
        });

        client.close();
        client.closed().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChannelState::Closing, ChannelState::Closed],
        );
    }

    #[tokio::test]
    async fn unhandled_label_is_dropped() {
        // The server has no announce handler; the announce request simply
        // times out on the client.
        let (client, _server) = loopback(Handlers::new()).await;
        let result = client.announce(Frame::new(), Duration::from_millis(100)).await;
        assert_eq!(result.unwrap_err(), ErrorCode::Timeout);
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn oversized_payload_is_serialization_error() {
        let (client, _server) = loopback(Handlers::new()).await;
        let result = client
            .invoke(Frame::from_vec(vec![0; usize::from(u16::MAX)]), Duration::from_secs(1))
            .await;
        assert_eq!(result.unwrap_err(), ErrorCode::Serialization);
    }
}
