//! Numeric error codes carried across API and process boundaries.

/// Status of an operation, stable on the wire.
///
/// No exception semantics cross a channel; a failed call comes back as one of
/// these codes and the caller decides how to recover.
#[derive(thiserror::Error, Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// The operation succeeded.
    #[error("success")]
    Ok = 0,

    /// Unclassified failure.
    #[error("general failure")]
    General = 1,

    /// The interface is not supported or the peer is unreachable.
    #[error("unavailable")]
    Unavailable = 2,

    /// The call did not complete within the caller's budget. The outstanding
    /// request is not cancelled on the peer.
    #[error("timed out")]
    Timeout = 3,

    /// The channel opened but the announce handshake did not complete.
    #[error("opening failed")]
    OpeningFailed = 4,

    /// The operation is not valid in the current lifecycle state.
    #[error("illegal state")]
    IllegalState = 5,

    /// A stub could not resolve an interface-typed argument.
    #[error("rpc call failed")]
    RpcCallFailed = 6,

    /// A message could not be encoded or decoded.
    #[error("serialization failed")]
    Serialization = 7,

    /// The channel closed while the call was outstanding.
    #[error("channel closed")]
    ChannelClosed = 8,

    /// The peer reported a failure servicing the call.
    #[error("call failed")]
    CallFailed = 9,

    /// A supervised child process could not be started.
    #[error("instantiation failed")]
    InstantiationFailed = 10,
}

impl ErrorCode {
    /// Decodes a wire value; unknown codes collapse to [`ErrorCode::General`].
    pub fn from_wire(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            2 => Self::Unavailable,
            3 => Self::Timeout,
            4 => Self::OpeningFailed,
            5 => Self::IllegalState,
            6 => Self::RpcCallFailed,
            7 => Self::Serialization,
            8 => Self::ChannelClosed,
            9 => Self::CallFailed,
            10 => Self::InstantiationFailed,
            _ => Self::General,
        }
    }

    /// Encodes this code for the wire.
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Converts a code into a `Result`, mapping [`ErrorCode::Ok`] to `Ok(())`.
    pub fn into_result(self) -> Result<(), ErrorCode> {
        match self {
            Self::Ok => Ok(()),
            code => Err(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::General,
            ErrorCode::Unavailable,
            ErrorCode::Timeout,
            ErrorCode::OpeningFailed,
            ErrorCode::IllegalState,
            ErrorCode::RpcCallFailed,
            ErrorCode::Serialization,
            ErrorCode::ChannelClosed,
            ErrorCode::CallFailed,
            ErrorCode::InstantiationFailed,
        ] {
            assert_eq!(ErrorCode::from_wire(code.to_wire()), code);
        }
    }

    #[test]
    fn unknown_codes_collapse_to_general() {
        assert_eq!(ErrorCode::from_wire(0xdead_beef), ErrorCode::General);
    }

    #[test]
    fn into_result() {
        assert!(ErrorCode::Ok.into_result().is_ok());
        assert_eq!(
            ErrorCode::Timeout.into_result(),
            Err(ErrorCode::Timeout),
        );
    }
}
