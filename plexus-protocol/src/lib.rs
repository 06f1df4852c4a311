//! Defines the wire protocol spoken between plexus processes.
//!
//! Every message on a channel is an [`Envelope`]: a length-prefixed frame
//! carrying a label (announce or invoke), a request ordinal for correlation,
//! and an opaque [`Frame`] payload. The payload shapes ([`Init`], [`Setup`],
//! [`InvokeRequest`], [`InvokeResponse`]) are defined here as well; the codec
//! itself performs no schema validation, higher layers own the semantics.

#![forbid(unsafe_code)]

mod codec;
mod error;
mod frame;
mod ids;
mod message;

pub use codec::{Codec, CodecError, Envelope, ANNOUNCE_LABEL, INVOKE_LABEL, RESPONSE_FLAG};
pub use error::ErrorCode;
pub use frame::{Frame, FrameError, FrameReader};
pub use ids::{
    ConnectionId, ExchangeId, InstanceId, InterfaceId, MethodId, RawInstance, Version,
    PARENT_EXCHANGE_ID_VARIABLE,
};
pub use message::{AnnounceKind, Init, InvokeRequest, InvokeResponse, Setup, CLASS_NAME_LENGTH};
