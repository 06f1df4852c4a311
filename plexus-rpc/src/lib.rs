//! Object registry and proxy/stub dispatch for the plexus runtime.
//!
//! The [`Administrator`] owns the three process-wide tables: local
//! implementations exposed over channels, proxies imported from peers, and
//! the per-interface factory glue that marshals calls. Proxies and
//! implementations participate in a distributed refcount upheld by
//! symmetrical acquire/revoke announces; a channel close drains everything
//! the peer held.
//!
//! Initialise one administrator per process before any interface use and
//! keep it alive until the last channel has drained.

mod administrator;
mod handlers;
mod loader;
mod object;
mod proxy;
mod stub;

pub use administrator::{Administrator, AnnounceOutcome};
pub use handlers::{AnnounceHandler, InvokeHandler};
pub use loader::{load_proxy_stubs, Registration, PROXY_STUB_ENTRY_POINT};
pub use object::{ObjectRef, Origin, RemoteObject};
pub use proxy::{ProxyHandle, ProxyState};
pub use stub::{ProxyStubPair, StubContext, StubDispatch};
