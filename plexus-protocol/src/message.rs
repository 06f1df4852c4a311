//! The two message shapes recognised on a channel: announces and invokes.
//!
//! An announce carries lifecycle intent ([`Init`]) and is answered with a
//! [`Setup`]; an invoke carries one method call ([`InvokeRequest`]) and is
//! answered with an [`InvokeResponse`].

use crate::error::ErrorCode;
use crate::frame::{Frame, FrameError, FrameReader};
use crate::ids::{ExchangeId, InstanceId, InterfaceId, MethodId, Version};

/// Fixed width of the class-name field in an [`Init`] record.
pub const CLASS_NAME_LENGTH: usize = 64;

/// Intent of an announce, encoded in the class-name field.
///
/// A leading NUL marks the field as a discriminator: the second byte then
/// holds the kind. A non-NUL first byte is an acquire-by-name carrying the
/// class name itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AnnounceKind {
    /// "Give me an implementation of a named class"; the receiver may
    /// instantiate one.
    Acquire,
    /// "I hold this implementation and am exposing it to you."
    Offer,
    /// Inverse of [`AnnounceKind::Offer`]; releases outstanding counts.
    Revoke,
    /// "I want a proxy for this specific (instance, interface)."
    Request,
}

impl AnnounceKind {
    fn to_wire(self) -> u8 {
        match self {
            Self::Acquire => 0,
            Self::Offer => 1,
            Self::Revoke => 2,
            Self::Request => 3,
        }
    }

    fn from_wire(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Acquire),
            1 => Ok(Self::Offer),
            2 => Ok(Self::Revoke),
            3 => Ok(Self::Request),
            value => Err(FrameError::InvalidDiscriminator { value }),
        }
    }
}

/// Parameters of an announce message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Init {
    /// Sender's process id, for diagnostics.
    pub id: u32,
    /// Instance the announce refers to; empty for acquire-by-name.
    pub instance: InstanceId,
    /// Interface the announce refers to.
    pub interface: InterfaceId,
    /// Exchange id routing a child's offer back to the parent request.
    pub exchange: ExchangeId,
    /// Requested interface version; only meaningful for acquires.
    pub version: Version,
    kind: AnnounceKind,
    class_name: String,
}

impl Init {
    /// An acquire-by-name announce: instantiate `class_name` and hand the
    /// result back.
    pub fn acquire(
        id: u32,
        class_name: impl Into<String>,
        interface: InterfaceId,
        version: Version,
        exchange: ExchangeId,
    ) -> Self {
        Self {
            id,
            instance: InstanceId::EMPTY,
            interface,
            exchange,
            version,
            kind: AnnounceKind::Acquire,
            class_name: class_name.into(),
        }
    }

    /// A request for a proxy to a specific instance the peer already owns.
    pub fn request(
        id: u32,
        interface: InterfaceId,
        instance: InstanceId,
        exchange: ExchangeId,
    ) -> Self {
        Self::keyed(id, interface, instance, exchange, AnnounceKind::Request)
    }

    /// An offer publishing a locally registered instance to the peer.
    pub fn offer(
        id: u32,
        interface: InterfaceId,
        instance: InstanceId,
        exchange: ExchangeId,
    ) -> Self {
        Self::keyed(id, interface, instance, exchange, AnnounceKind::Offer)
    }

    /// A revoke releasing counts previously taken on `instance`.
    pub fn revoke(
        id: u32,
        interface: InterfaceId,
        instance: InstanceId,
        exchange: ExchangeId,
    ) -> Self {
        Self::keyed(id, interface, instance, exchange, AnnounceKind::Revoke)
    }

    fn keyed(
        id: u32,
        interface: InterfaceId,
        instance: InstanceId,
        exchange: ExchangeId,
        kind: AnnounceKind,
    ) -> Self {
        Self {
            id,
            instance,
            interface,
            exchange,
            version: Version(0),
            kind,
            class_name: String::new(),
        }
    }

    /// Intent of this announce.
    pub fn kind(&self) -> AnnounceKind {
        self.kind
    }

    /// Requested class name; empty unless this is an acquire.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Encodes this record into `frame`.
    pub fn encode(&self, frame: &mut Frame) -> Result<(), FrameError> {
        frame.write_u32(self.id);
        frame.write_instance(self.instance);
        frame.write_u32(self.interface.0);
        frame.write_u32(self.exchange.0);
        frame.write_u32(self.version.0);

        let mut name = [0u8; CLASS_NAME_LENGTH];
        match self.kind {
            AnnounceKind::Acquire => {
                // The terminating NUL must fit alongside the name.
                if self.class_name.len() >= CLASS_NAME_LENGTH {
                    return Err(FrameError::Oversized {
                        len: self.class_name.len(),
                    });
                }
                if self.class_name.bytes().any(|byte| byte == 0) {
                    return Err(FrameError::InteriorNul);
                }
                name[..self.class_name.len()].copy_from_slice(self.class_name.as_bytes());
            }
            kind => {
                name[1] = kind.to_wire();
            }
        }
        frame.write_raw(&name);
        Ok(())
    }

    /// Decodes a record from `reader`.
    pub fn decode(reader: &mut FrameReader<'_>) -> Result<Self, FrameError> {
        let id = reader.read_u32()?;
        let instance = reader.read_instance()?;
        let interface = InterfaceId(reader.read_u32()?);
        let exchange = ExchangeId(reader.read_u32()?);
        let version = Version(reader.read_u32()?);
        let name = reader.read_raw(CLASS_NAME_LENGTH)?;

        let (kind, class_name) = if name[0] == 0 {
            (AnnounceKind::from_wire(name[1])?, String::new())
        } else {
            let nul = name.iter().position(|byte| *byte == 0).unwrap_or(name.len());
            (
                AnnounceKind::Acquire,
                std::str::from_utf8(&name[..nul])?.to_owned(),
            )
        };

        Ok(Self {
            id,
            instance,
            interface,
            exchange,
            version,
            kind,
            class_name,
        })
    }
}

/// Response to an announce.
///
/// An empty response frame means the peer accepted the connection but offered
/// no object; [`Setup::decode`] models that as `None`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Setup {
    /// Handle of the object the peer pinned for the announcer.
    pub instance: InstanceId,
    /// Directory of proxy-stub libraries the announcer should load.
    pub proxy_stub_path: String,
    /// Trace configuration the announcer may apply.
    pub trace_categories: String,
}

impl Setup {
    /// Encodes this record into `frame`.
    pub fn encode(&self, frame: &mut Frame) -> Result<(), FrameError> {
        frame.write_instance(self.instance);
        frame.write_string(&self.proxy_stub_path)?;
        frame.write_string(&self.trace_categories)?;
        Ok(())
    }

    /// Decodes a record; an exhausted reader yields `None`.
    pub fn decode(reader: &mut FrameReader<'_>) -> Result<Option<Self>, FrameError> {
        if reader.is_exhausted() {
            return Ok(None);
        }
        Ok(Some(Self {
            instance: reader.read_instance()?,
            proxy_stub_path: reader.read_string()?,
            trace_categories: reader.read_string()?,
        }))
    }
}

/// Parameters of one method invocation.
#[derive(Clone, Debug)]
pub struct InvokeRequest {
    /// Implementation the call targets, in the receiver's registry.
    pub instance: InstanceId,
    /// Interface the ordinal belongs to.
    pub interface: InterfaceId,
    /// Method ordinal within the interface.
    pub method: MethodId,
    /// Marshalled arguments.
    pub args: Frame,
}

impl InvokeRequest {
    /// Encodes this record into `frame`.
    pub fn encode(&self, frame: &mut Frame) {
        frame.write_instance(self.instance);
        frame.write_u32(self.interface.0);
        frame.write_u8(self.method.0);
        frame.write_raw(self.args.as_slice());
    }

    /// Decodes a record from `reader`; the remainder becomes the argument
    /// frame.
    pub fn decode(reader: &mut FrameReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            instance: reader.read_instance()?,
            interface: InterfaceId(reader.read_u32()?),
            method: MethodId(reader.read_u8()?),
            args: Frame::from_vec(reader.remaining().to_vec()),
        })
    }
}

/// Receiver-provided result of one method invocation.
#[derive(Clone, Debug)]
pub struct InvokeResponse {
    /// Outcome reported by the stub.
    pub code: ErrorCode,
    /// Marshalled return values; empty on failure.
    pub result: Frame,
}

impl InvokeResponse {
    /// Encodes this record into `frame`.
    pub fn encode(&self, frame: &mut Frame) {
        frame.write_u32(self.code.to_wire());
        frame.write_raw(self.result.as_slice());
    }

    /// Decodes a record from `reader`; the remainder becomes the result
    /// frame.
    pub fn decode(reader: &mut FrameReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            code: ErrorCode::from_wire(reader.read_u32()?),
            result: Frame::from_vec(reader.remaining().to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_round_trip() {
        let init = Init::acquire(1234, "WebServer", InterfaceId(0x100), Version(1), ExchangeId(7));
        let mut frame = Frame::new();
        init.encode(&mut frame).unwrap();

        let decoded = Init::decode(&mut frame.reader()).unwrap();
        assert_eq!(decoded, init);
        assert_eq!(decoded.kind(), AnnounceKind::Acquire);
        assert_eq!(decoded.class_name(), "WebServer");
    }

    #[test]
    fn keyed_kinds_round_trip() {
        for (init, kind) in [
            (
                Init::offer(1, InterfaceId(0x42), InstanceId::from_raw(9), ExchangeId(3)),
                AnnounceKind::Offer,
            ),
            (
                Init::revoke(1, InterfaceId(0x42), InstanceId::from_raw(9), ExchangeId(3)),
                AnnounceKind::Revoke,
            ),
            (
                Init::request(1, InterfaceId(0x42), InstanceId::from_raw(9), ExchangeId(3)),
                AnnounceKind::Request,
            ),
        ] {
            let mut frame = Frame::new();
            init.encode(&mut frame).unwrap();
            let decoded = Init::decode(&mut frame.reader()).unwrap();
            assert_eq!(decoded.kind(), kind);
            assert_eq!(decoded.instance, InstanceId::from_raw(9));
            assert!(decoded.class_name().is_empty());
        }
    }

    #[test]
    fn init_has_fixed_width_class_name() {
        let init = Init::acquire(1, "X", InterfaceId(0x100), Version(1), ExchangeId::NONE);
        let mut frame = Frame::new();
        init.encode(&mut frame).unwrap();
        assert_eq!(frame.len(), 4 + InstanceId::WIDTH + 4 + 4 + 4 + CLASS_NAME_LENGTH);
    }

    #[test]
    fn oversized_class_name_is_rejected() {
        let name = "x".repeat(CLASS_NAME_LENGTH);
        let init = Init::acquire(1, name, InterfaceId(0x100), Version(1), ExchangeId::NONE);
        assert!(init.encode(&mut Frame::new()).is_err());
    }

    #[test]
    fn bad_kind_discriminator_fails() {
        let init = Init::offer(1, InterfaceId(1), InstanceId::from_raw(1), ExchangeId::NONE);
        let mut frame = Frame::new();
        init.encode(&mut frame).unwrap();

        // Corrupt the kind byte (first byte after the fixed header).
        let mut bytes = frame.into_vec();
        let kind_at = 4 + InstanceId::WIDTH + 4 + 4 + 4 + 1;
        bytes[kind_at] = 17;
        let frame = Frame::from_vec(bytes);
        assert!(matches!(
            Init::decode(&mut frame.reader()),
            Err(FrameError::InvalidDiscriminator { value: 17 })
        ));
    }

    #[test]
    fn setup_round_trip_and_empty() {
        let setup = Setup {
            instance: InstanceId::from_raw(0x1000),
            proxy_stub_path: "/usr/lib/plexus/proxystubs".into(),
            trace_categories: "plexus=debug".into(),
        };
        let mut frame = Frame::new();
        setup.encode(&mut frame).unwrap();
        assert_eq!(Setup::decode(&mut frame.reader()).unwrap(), Some(setup));

        let empty = Frame::new();
        assert_eq!(Setup::decode(&mut empty.reader()).unwrap(), None);
    }

    #[test]
    fn invoke_round_trip() {
        let mut args = Frame::new();
        args.write_u32(99);
        let request = InvokeRequest {
            instance: InstanceId::from_raw(0xbeef),
            interface: InterfaceId(0x200),
            method: MethodId(3),
            args,
        };
        let mut frame = Frame::new();
        request.encode(&mut frame);

        let decoded = InvokeRequest::decode(&mut frame.reader()).unwrap();
        assert_eq!(decoded.instance, InstanceId::from_raw(0xbeef));
        assert_eq!(decoded.interface, InterfaceId(0x200));
        assert_eq!(decoded.method, MethodId(3));
        assert_eq!(decoded.args.reader().read_u32().unwrap(), 99);
    }

    #[test]
    fn invoke_response_carries_code() {
        let response = InvokeResponse {
            code: ErrorCode::RpcCallFailed,
            result: Frame::new(),
        };
        let mut frame = Frame::new();
        response.encode(&mut frame);

        let decoded = InvokeResponse::decode(&mut frame.reader()).unwrap();
        assert_eq!(decoded.code, ErrorCode::RpcCallFailed);
        assert!(decoded.result.is_empty());
    }
}
