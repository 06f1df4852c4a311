//! Server-side view of one opened remote process.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plexus_ipc::Channel;
use plexus_protocol::{
    ConnectionId, ErrorCode, ExchangeId, Frame, Init, InstanceId, InterfaceId, Setup, Version,
};
use plexus_rpc::{Administrator, RemoteObject};

use crate::process::{Process, ShutdownSchedule};

/// Lifecycle of a [`RemoteConnection`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionLifecycle {
    /// Channel accepted, nothing heard yet.
    Constructed,
    /// First announce received.
    Announced,
    /// The initial object has been handed out.
    Active,
    /// Teardown initiated by either side.
    Terminating,
    /// All per-channel counts have drained.
    Dead,
}

/// One opened peer, tracked by the communicator.
pub struct RemoteConnection {
    id: ConnectionId,
    channel: Channel,
    administrator: Arc<Administrator>,
    callsign: Mutex<String>,
    process_id: AtomicU32,
    lifecycle: Mutex<ConnectionLifecycle>,
    /// Present when this communicator launched the peer.
    process: Mutex<Option<Process>>,
    /// Last object the peer offered, if any arrived outside a pending
    /// launch.
    offered: Mutex<Option<(InstanceId, InterfaceId)>>,
    schedule: ShutdownSchedule,
}

impl fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("id", &self.id)
            .field("callsign", &*self.callsign.lock().expect("poisoned"))
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl RemoteConnection {
    pub(crate) fn new(
        id: ConnectionId,
        channel: Channel,
        administrator: Arc<Administrator>,
        schedule: ShutdownSchedule,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            channel,
            administrator,
            callsign: Mutex::new(String::new()),
            process_id: AtomicU32::new(0),
            lifecycle: Mutex::new(ConnectionLifecycle::Constructed),
            process: Mutex::new(None),
            offered: Mutex::new(None),
            schedule,
        })
    }

    /// Unique identity of this connection (monotonic, never 0).
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The channel to the peer.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Human tag of the peer, for diagnostics.
    pub fn callsign(&self) -> String {
        self.callsign.lock().expect("poisoned").clone()
    }

    pub(crate) fn set_callsign(&self, callsign: &str) {
        *self.callsign.lock().expect("poisoned") = callsign.to_owned();
    }

    /// Operating-system process id the peer announced.
    pub fn process_id(&self) -> u32 {
        self.process_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_process_id(&self, process_id: u32) {
        self.process_id.store(process_id, Ordering::Release);
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> ConnectionLifecycle {
        *self.lifecycle.lock().expect("poisoned")
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: ConnectionLifecycle) {
        *self.lifecycle.lock().expect("poisoned") = lifecycle;
    }

    pub(crate) fn attach_process(&self, process: Process) {
        *self.process.lock().expect("poisoned") = Some(process);
    }

    /// Whether a launched peer process is still running.
    pub fn is_process_active(&self) -> bool {
        self.process
            .lock()
            .expect("poisoned")
            .as_ref()
            .is_some_and(Process::is_active)
    }

    pub(crate) fn set_offered(&self, instance: InstanceId, interface: InterfaceId) {
        *self.offered.lock().expect("poisoned") = Some((instance, interface));
    }

    /// Last object the peer offered outside a pending launch, if any.
    pub fn offered(&self) -> Option<(InstanceId, InterfaceId)> {
        *self.offered.lock().expect("poisoned")
    }

    /// Acquires an object from the peer over this connection.
    ///
    /// The peer pins the instance on this channel before replying, so the
    /// returned proxy needs no further announce.
    #[tracing::instrument(skip(self), fields(connection = %self.id))]
    pub async fn acquire(
        &self,
        class_name: &str,
        interface: InterfaceId,
        version: Version,
        timeout: Duration,
    ) -> Result<RemoteObject, ErrorCode> {
        let init = Init::acquire(
            self.administrator.process_id(),
            class_name,
            interface,
            version,
            ExchangeId::NONE,
        );
        let mut frame = Frame::new();
        init.encode(&mut frame).map_err(|_| ErrorCode::Serialization)?;

        let reply = self.channel.announce(frame, timeout).await?;
        let setup = Setup::decode(&mut reply.reader()).map_err(|_| ErrorCode::Serialization)?;
        let Some(setup) = setup else {
            return Err(ErrorCode::Unavailable);
        };
        if setup.instance.is_empty() {
            return Err(ErrorCode::Unavailable);
        }

        self.administrator
            .proxy_object(&self.channel, setup.instance, interface, true, timeout)
            .await
    }

    /// Starts tearing the peer down.
    ///
    /// A launched child gets the kill escalation and is expected to close
    /// the channel on its way out; an externally connected peer just has
    /// its channel closed.
    pub fn terminate(&self) {
        self.set_lifecycle(ConnectionLifecycle::Terminating);

        let process = self.process.lock().expect("poisoned");
        match process.as_ref() {
            Some(process) => {
                // The channel stays up so the dying side can still release
                // its interfaces; it closes by definition when the process
                // exits.
                process.terminate(self.schedule);
            }
            None => {
                self.channel.close();
            }
        }
    }
}
