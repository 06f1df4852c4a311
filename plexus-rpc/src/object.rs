//! Type-erased handles to interface implementations.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use plexus_ipc::ChannelId;
use plexus_protocol::{InstanceId, InterfaceId, Version};

use crate::proxy::ProxyHandle;

/// Where an object lives, from this process's point of view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Origin {
    /// The implementation lives in this process.
    Local,

    /// The object is a surrogate for an implementation owned by the peer on
    /// the given channel.
    Proxy {
        /// Channel the proxy is bound to.
        channel: ChannelId,
        /// Handle of the implementation in the owner's registry.
        instance: InstanceId,
    },
}

/// Hook answering cross-boundary `QueryInterface` for one implementation.
pub type QueryHook = Arc<dyn Fn(InterfaceId) -> Option<RemoteObject> + Send + Sync>;

/// A reference-counted, type-erased handle to one interface implementation.
///
/// The payload always erases an `Arc<dyn I>` for the interface named by
/// `interface_id`; [`RemoteObject::downcast`] recovers the typed form.
/// Cloning shares the implementation.
#[derive(Clone)]
pub struct RemoteObject {
    interface_id: InterfaceId,
    version: Version,
    // Data pointer of the erased `Arc`; stable across clones, used to give
    // the same implementation the same wire handle.
    identity: usize,
    origin: Origin,
    payload: Arc<dyn Any + Send + Sync>,
    query: Option<QueryHook>,
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("interface", &self.interface_id)
            .field("version", &self.version)
            .field("origin", &self.origin)
            .finish()
    }
}

impl RemoteObject {
    /// Erases a local implementation of the interface `I` (use
    /// `Arc<dyn I>` as the object).
    pub fn new<I>(interface_id: InterfaceId, version: Version, object: Arc<I>) -> Self
    where
        I: ?Sized + Send + Sync + 'static,
        Arc<I>: Send + Sync,
    {
        let identity = Arc::as_ptr(&object) as *const () as usize;
        Self {
            interface_id,
            version,
            identity,
            origin: Origin::Local,
            payload: Arc::new(object),
            query: None,
        }
    }

    /// Erases a typed proxy produced by a factory for `handle`.
    pub fn proxy<I>(
        interface_id: InterfaceId,
        version: Version,
        object: Arc<I>,
        handle: &ProxyHandle,
    ) -> Self
    where
        I: ?Sized + Send + Sync + 'static,
        Arc<I>: Send + Sync,
    {
        let mut remote = Self::new(interface_id, version, object);
        remote.origin = Origin::Proxy {
            channel: handle.channel().id(),
            instance: handle.instance(),
        };
        remote
    }

    /// Attaches a hook answering [`RemoteObject::query_interface`] for
    /// interfaces beyond the primary one.
    pub fn with_query(
        mut self,
        query: impl Fn(InterfaceId) -> Option<RemoteObject> + Send + Sync + 'static,
    ) -> Self {
        self.query = Some(Arc::new(query));
        self
    }

    /// The interface this handle exposes.
    pub fn interface_id(&self) -> InterfaceId {
        self.interface_id
    }

    /// The implementation's declared version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Identity of the underlying allocation; equal for clones of the same
    /// implementation handle.
    pub fn identity(&self) -> usize {
        self.identity
    }

    /// Where the implementation lives.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Recovers the typed `Arc<dyn I>` this handle erases.
    ///
    /// Returns `None` when asked for a different interface type than the
    /// handle was created with.
    pub fn downcast<I>(&self) -> Option<Arc<I>>
    where
        I: ?Sized + Send + Sync + 'static,
        Arc<I>: Send + Sync + Clone,
    {
        self.payload
            .clone()
            .downcast::<Arc<I>>()
            .ok()
            .map(|object| (*object).clone())
    }

    /// Resolves this implementation under another interface.
    ///
    /// Asking for the primary interface returns the handle itself; anything
    /// else is delegated to the implementation's query hook. The result may
    /// share this handle's identity (one implementation satisfying both
    /// interfaces) or carry a fresh one.
    pub fn query_interface(&self, interface_id: InterfaceId) -> Option<RemoteObject> {
        if interface_id == self.interface_id {
            return Some(self.clone());
        }
        self.query.as_ref().and_then(|query| query(interface_id))
    }
}

/// A typed view over a [`RemoteObject`].
///
/// Interface methods that carry interface-typed parameters use `ObjectRef`
/// so call sites keep the trait object while the dispatch layer keeps the
/// marshalling metadata.
pub struct ObjectRef<I: ?Sized> {
    remote: RemoteObject,
    typed: Arc<I>,
}

impl<I: ?Sized> Clone for ObjectRef<I> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            typed: self.typed.clone(),
        }
    }
}

impl<I: ?Sized> fmt::Debug for ObjectRef<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectRef").field(&self.remote).finish()
    }
}

impl<I> ObjectRef<I>
where
    I: ?Sized + Send + Sync + 'static,
    Arc<I>: Send + Sync + Clone,
{
    /// Wraps a local implementation.
    pub fn local(interface_id: InterfaceId, version: Version, object: Arc<I>) -> Self {
        Self {
            remote: RemoteObject::new(interface_id, version, object.clone()),
            typed: object,
        }
    }

    /// Types an erased handle; `None` when the handle does not erase
    /// `Arc<I>`.
    pub fn from_remote(remote: RemoteObject) -> Option<Self> {
        let typed = remote.downcast::<I>()?;
        Some(Self { remote, typed })
    }

    /// The erased handle, for marshalling.
    pub fn remote(&self) -> &RemoteObject {
        &self.remote
    }

    /// The typed implementation handle.
    pub fn get(&self) -> &Arc<I> {
        &self.typed
    }
}

impl<I: ?Sized> std::ops::Deref for ObjectRef<I> {
    type Target = I;

    fn deref(&self) -> &I {
        &self.typed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Counter: Send + Sync {
        fn value(&self) -> u32;
    }

    trait Other: Send + Sync {}

    struct FortyTwo;

    impl Counter for FortyTwo {
        fn value(&self) -> u32 {
            42
        }
    }

    const COUNTER_ID: InterfaceId = InterfaceId(0x100);

    #[test]
    fn downcast_round_trip() {
        let object: Arc<dyn Counter> = Arc::new(FortyTwo);
        let remote = RemoteObject::new::<dyn Counter>(COUNTER_ID, Version(1), object);

        let typed = remote.downcast::<dyn Counter>().unwrap();
        assert_eq!(typed.value(), 42);

        // A different erasure target misses.
        assert!(remote.downcast::<dyn Other>().is_none());
    }

    #[test]
    fn identity_is_stable_across_clones() {
        let object: Arc<dyn Counter> = Arc::new(FortyTwo);
        let first = RemoteObject::new::<dyn Counter>(COUNTER_ID, Version(1), object.clone());
        let second = RemoteObject::new::<dyn Counter>(COUNTER_ID, Version(1), object);
        assert_eq!(first.identity(), second.identity());

        let other: Arc<dyn Counter> = Arc::new(FortyTwo);
        let third = RemoteObject::new::<dyn Counter>(COUNTER_ID, Version(1), other);
        assert_ne!(first.identity(), third.identity());
    }

    #[test]
    fn query_interface_defaults_to_primary_only() {
        let object: Arc<dyn Counter> = Arc::new(FortyTwo);
        let remote = RemoteObject::new::<dyn Counter>(COUNTER_ID, Version(1), object);

        assert!(remote.query_interface(COUNTER_ID).is_some());
        assert!(remote.query_interface(InterfaceId(0x200)).is_none());
    }

    #[test]
    fn object_ref_types_an_erased_handle() {
        let reference = ObjectRef::<dyn Counter>::local(COUNTER_ID, Version(1), Arc::new(FortyTwo));
        assert_eq!(reference.value(), 42);

        let remote = reference.remote().clone();
        let again = ObjectRef::<dyn Counter>::from_remote(remote).unwrap();
        assert_eq!(again.get().value(), 42);
    }
}
