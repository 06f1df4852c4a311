//! Shared fixture: a tiny interface with generated-shaped glue.

use std::sync::Arc;
use std::time::Duration;

use plexus_protocol::{ErrorCode, Frame, InterfaceId, MethodId, Version};
use plexus_rpc::{ProxyHandle, ProxyStubPair, RemoteObject, StubContext, StubDispatch};

/// Interface id used by the fixture widget.
pub const WIDGET_INTERFACE: InterfaceId = InterfaceId(0x100);

/// Version of the fixture widget contract.
pub const WIDGET_VERSION: Version = Version(1);

/// Invoke budget used across the tests.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

const WIDGET_MAGIC: MethodId = MethodId(0);

/// The fixture contract: method 0 takes no arguments and returns 42.
#[async_trait::async_trait]
pub trait Widget: Send + Sync {
    /// Returns the well-known answer.
    async fn magic(&self) -> Result<u32, ErrorCode>;
}

/// A local widget implementation.
pub struct StockWidget;

#[async_trait::async_trait]
impl Widget for StockWidget {
    async fn magic(&self) -> Result<u32, ErrorCode> {
        Ok(42)
    }
}

/// Erases a fresh widget implementation.
pub fn widget_object() -> RemoteObject {
    let widget: Arc<dyn Widget> = Arc::new(StockWidget);
    RemoteObject::new::<dyn Widget>(WIDGET_INTERFACE, WIDGET_VERSION, widget)
}

struct WidgetProxy {
    handle: ProxyHandle,
}

#[async_trait::async_trait]
impl Widget for WidgetProxy {
    async fn magic(&self) -> Result<u32, ErrorCode> {
        let result = self.handle.invoke(WIDGET_MAGIC, Frame::new(), RPC_TIMEOUT).await?;
        result.reader().read_u32().map_err(|_| ErrorCode::Serialization)
    }
}

struct WidgetStub;

#[async_trait::async_trait]
impl StubDispatch for WidgetStub {
    async fn dispatch(
        &self,
        context: StubContext<'_>,
        method: MethodId,
        _args: Frame,
    ) -> Result<Frame, ErrorCode> {
        let implementation = context
            .object
            .downcast::<dyn Widget>()
            .ok_or(ErrorCode::RpcCallFailed)?;

        match method {
            WIDGET_MAGIC => {
                let mut result = Frame::new();
                result.write_u32(implementation.magic().await?);
                Ok(result)
            }
            _ => Err(ErrorCode::Unavailable),
        }
    }
}

/// The registered glue for [`Widget`].
pub fn widget_pair() -> ProxyStubPair {
    ProxyStubPair {
        interface_id: WIDGET_INTERFACE,
        version: WIDGET_VERSION,
        proxy: |handle| {
            let proxy: Arc<dyn Widget> = Arc::new(WidgetProxy {
                handle: handle.clone(),
            });
            RemoteObject::proxy::<dyn Widget>(WIDGET_INTERFACE, WIDGET_VERSION, proxy, &handle)
        },
        stub: Arc::new(WidgetStub),
    }
}
