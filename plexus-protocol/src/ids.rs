//! Identity newtypes shared by every layer of the runtime.

use std::fmt;

#[cfg(all(feature = "handle-32", feature = "handle-64"))]
compile_error!("features `handle-32` and `handle-64` are mutually exclusive");
#[cfg(all(feature = "handle-32", feature = "handle-128"))]
compile_error!("features `handle-32` and `handle-128` are mutually exclusive");
#[cfg(all(feature = "handle-64", feature = "handle-128"))]
compile_error!("features `handle-64` and `handle-128` are mutually exclusive");
#[cfg(not(any(feature = "handle-32", feature = "handle-64", feature = "handle-128")))]
compile_error!("exactly one of the `handle-*` features must be enabled");

/// Raw integer type backing [`InstanceId`], selected at build time.
#[cfg(feature = "handle-32")]
pub type RawInstance = u32;
/// Raw integer type backing [`InstanceId`], selected at build time.
#[cfg(feature = "handle-64")]
pub type RawInstance = u64;
/// Raw integer type backing [`InstanceId`], selected at build time.
#[cfg(feature = "handle-128")]
pub type RawInstance = u128;

/// Environment variable carrying the parent's exchange id into a launched
/// child process.
pub const PARENT_EXCHANGE_ID_VARIABLE: &str = "COM_PARENT_EXCHANGE_ID";

/// Numeric identity of an interface contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct InterfaceId(pub u32);

impl InterfaceId {
    /// Wildcard used in announces that do not name a specific interface.
    pub const ANY: Self = Self(u32::MAX);
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Version of an interface contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Version(pub u32);

impl Version {
    /// Matches any published version.
    pub const ANY: Self = Self(u32::MAX);
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque handle naming one implementation within the owning process.
///
/// Handles are keys into the owner's registry and are never dereferenced by
/// the peer. The wire width is fixed per build by the `handle-*` features.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct InstanceId(RawInstance);

impl InstanceId {
    /// The reserved "no object" handle.
    pub const EMPTY: Self = Self(0);

    /// Number of bytes a handle occupies on the wire.
    pub const WIDTH: usize = size_of::<RawInstance>();

    /// Wraps a raw handle value.
    pub const fn from_raw(raw: RawInstance) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    pub const fn to_raw(self) -> RawInstance {
        self.0
    }

    /// Whether this is the reserved empty handle.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier a child uses to associate its offer with a particular parent
/// request. 0 means "top-level process, no parent".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ExchangeId(pub u32);

impl ExchangeId {
    /// The top-level process, launched by nobody.
    pub const NONE: Self = Self(0);

    /// Reads the exchange id handed down by a supervising parent process.
    ///
    /// An absent or empty [`PARENT_EXCHANGE_ID_VARIABLE`] means this process
    /// is top-level. A malformed value is treated the same way.
    pub fn from_env() -> Self {
        match std::env::var(PARENT_EXCHANGE_ID_VARIABLE) {
            Ok(value) if !value.is_empty() => {
                Self(value.trim().parse().unwrap_or_default())
            }
            _ => Self::NONE,
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Server-side identity of one opened remote process.
///
/// Assigned monotonically starting at 1; 0 is reserved.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Method ordinal within an interface, assigned densely from 0 in
/// declaration order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MethodId(pub u8);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_instance_is_reserved() {
        assert!(InstanceId::EMPTY.is_empty());
        assert!(!InstanceId::from_raw(1).is_empty());
        assert_eq!(InstanceId::WIDTH, size_of::<RawInstance>());
    }

    #[test]
    fn exchange_id_from_env() {
        // Not set in the test environment.
        assert_eq!(ExchangeId::from_env(), ExchangeId::NONE);
    }

    #[test]
    fn display_formats() {
        assert_eq!(InterfaceId(0x100).to_string(), "0x00000100");
        assert_eq!(InstanceId::from_raw(0x2a).to_string(), "0x2a");
        assert_eq!(ConnectionId(7).to_string(), "7");
    }
}
