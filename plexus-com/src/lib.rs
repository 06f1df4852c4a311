//! Communicator endpoints for the plexus runtime.
//!
//! A [`Communicator`] owns a listening endpoint and an
//! [`Administrator`](plexus_rpc::Administrator): it accepts channels,
//! services acquire/offer announces, launches out-of-process components
//! through the [`process`] supervisor, and links to other hosts through
//! [`RemoteHost`]. A [`CommunicatorClient`] is the connecting side: it
//! performs the announce handshake and hands out typed proxies.

#![forbid(unsafe_code)]

mod client;
mod communicator;
mod connection;
mod linker;
mod process;
mod registry;

pub use client::{ClientMode, CommunicatorClient};
pub use communicator::{Communicator, CommunicatorConfig, HostingMode};
pub use connection::{ConnectionLifecycle, RemoteConnection};
pub use linker::{
    remote_linker_pair, LinkerService, RemoteHost, RemoteLinker, REMOTE_LINKER_CLASS,
    REMOTE_LINKER_INTERFACE,
};
pub use process::{
    exit_code, Container, Process, ProcessConfig, ShutdownSchedule, ANNOUNCE_TIMEOUT,
};
pub use registry::{ServiceFactory, ServiceRegistry};
