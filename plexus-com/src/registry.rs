//! The in-process service registry: class names to object factories.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use plexus_protocol::Version;
use plexus_rpc::RemoteObject;

/// Instantiates one class; `None` when the requested version cannot be
/// served.
pub type ServiceFactory = Arc<dyn Fn(Version) -> Option<RemoteObject> + Send + Sync>;

/// Maps class names to factories for in-process instantiation.
///
/// A class is a factory, not a singleton: two racing acquires for the same
/// name are both serviced and produce two distinct instances.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<Mutex<HashMap<String, ServiceFactory>>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let services = self.services.lock().expect("poisoned");
        f.debug_struct("ServiceRegistry")
            .field("classes", &services.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceRegistry {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the factory for `class_name`, replacing any earlier one.
    pub fn register(&self, class_name: impl Into<String>, factory: ServiceFactory) {
        self.services
            .lock()
            .expect("poisoned")
            .insert(class_name.into(), factory);
    }

    /// Instantiates `class_name` at `version`, if the class is known and the
    /// version served.
    pub fn instantiate(&self, class_name: &str, version: Version) -> Option<RemoteObject> {
        let factory = self
            .services
            .lock()
            .expect("poisoned")
            .get(class_name)
            .cloned()?;
        factory(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_protocol::InterfaceId;

    trait Marker: Send + Sync {}
    struct Widget;
    impl Marker for Widget {}

    fn factory() -> ServiceFactory {
        Arc::new(|version| {
            (version == Version(1) || version == Version::ANY).then(|| {
                let widget: Arc<dyn Marker> = Arc::new(Widget);
                RemoteObject::new::<dyn Marker>(InterfaceId(0x10), Version(1), widget)
            })
        })
    }

    #[test]
    fn instantiates_known_classes() {
        let registry = ServiceRegistry::new();
        registry.register("Widget", factory());

        assert!(registry.instantiate("Widget", Version(1)).is_some());
        assert!(registry.instantiate("Widget", Version(9)).is_none());
        assert!(registry.instantiate("Gadget", Version(1)).is_none());
    }

    #[test]
    fn each_acquire_gets_a_fresh_instance() {
        let registry = ServiceRegistry::new();
        registry.register("Widget", factory());

        let first = registry.instantiate("Widget", Version::ANY).unwrap();
        let second = registry.instantiate("Widget", Version::ANY).unwrap();
        assert_ne!(first.identity(), second.identity());
    }
}
