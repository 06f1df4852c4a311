//! Length-prefixed envelope codec for a byte-stream transport.
//!
//! Wire layout per message: `{u16 length, u8 label, u32 ordinal, payload}`,
//! integers little-endian, `length` covering everything after itself. The
//! high bit of the label marks a response; the ordinal correlates it with the
//! request it answers.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Frame;

/// Label of announce messages.
pub const ANNOUNCE_LABEL: u8 = 1;

/// Label of invoke messages.
pub const INVOKE_LABEL: u8 = 2;

/// Label bit distinguishing a response from a request.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Bytes of header covered by the length prefix (label + ordinal).
const HEADER_LENGTH: usize = 1 + 4;

/// One message as it travels on the wire.
#[derive(Clone, Debug)]
pub struct Envelope {
    label: u8,
    ordinal: u32,
    /// Message payload; its shape is implied by the label.
    pub payload: Frame,
}

impl Envelope {
    /// A request envelope for the given message label.
    pub fn request(label: u8, ordinal: u32, payload: Frame) -> Self {
        debug_assert_eq!(label & RESPONSE_FLAG, 0);
        Self {
            label,
            ordinal,
            payload,
        }
    }

    /// A response envelope correlated with `ordinal`.
    pub fn response(label: u8, ordinal: u32, payload: Frame) -> Self {
        Self {
            label: label | RESPONSE_FLAG,
            ordinal,
            payload,
        }
    }

    /// Whether this envelope answers an earlier request.
    pub fn is_response(&self) -> bool {
        self.label & RESPONSE_FLAG != 0
    }

    /// The message label with the response bit stripped.
    pub fn label(&self) -> u8 {
        self.label & !RESPONSE_FLAG
    }

    /// The correlation ordinal.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

/// Failure while encoding or decoding an [`Envelope`].
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The underlying transport failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A message was shorter than its fixed header.
    #[error("message of {length} bytes is shorter than the envelope header")]
    Malformed {
        /// Announced length of the broken message.
        length: usize,
    },

    /// A payload was too large for the 16-bit length prefix.
    #[error("payload of {len} bytes exceeds the envelope length prefix")]
    Oversized {
        /// Attempted payload length.
        len: usize,
    },
}

/// [`Decoder`]/[`Encoder`] implementation for [`Envelope`]s.
#[derive(Debug, Default)]
pub struct Codec {
    _private: (),
}

impl Codec {
    /// Returns a new `Codec`.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let length = usize::from(u16::from_le_bytes([src[0], src[1]]));
        if length < HEADER_LENGTH {
            return Err(CodecError::Malformed { length });
        }
        if src.len() < 2 + length {
            // Not enough for a whole message yet; reserve what we know is
            // still coming.
            src.reserve(2 + length - src.len());
            return Ok(None);
        }

        src.advance(2);
        let mut message = src.split_to(length);
        let label = message.get_u8();
        let ordinal = message.get_u32_le();

        Ok(Some(Envelope {
            label,
            ordinal,
            payload: Frame::from_vec(message.to_vec()),
        }))
    }
}

impl Encoder<Envelope> for Codec {
    type Error = CodecError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let length = HEADER_LENGTH + envelope.payload.len();
        let length = u16::try_from(length).map_err(|_| CodecError::Oversized {
            len: envelope.payload.len(),
        })?;

        dst.reserve(2 + usize::from(length));
        dst.put_u16_le(length);
        dst.put_u8(envelope.label);
        dst.put_u32_le(envelope.ordinal);
        dst.put_slice(envelope.payload.as_slice());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(envelope: Envelope) -> BytesMut {
        let mut buffer = BytesMut::new();
        Codec::new().encode(envelope, &mut buffer).unwrap();
        buffer
    }

    #[test]
    fn round_trip() {
        let mut payload = Frame::new();
        payload.write_u32(42);

        let mut buffer = encode(Envelope::request(INVOKE_LABEL, 7, payload));
        let decoded = Codec::new().decode(&mut buffer).unwrap().unwrap();

        assert_eq!(decoded.label(), INVOKE_LABEL);
        assert_eq!(decoded.ordinal(), 7);
        assert!(!decoded.is_response());
        assert_eq!(decoded.payload.reader().read_u32().unwrap(), 42);
        assert!(buffer.is_empty());
    }

    #[test]
    fn response_flag() {
        let envelope = Envelope::response(ANNOUNCE_LABEL, 3, Frame::new());
        assert!(envelope.is_response());
        assert_eq!(envelope.label(), ANNOUNCE_LABEL);

        let mut buffer = encode(envelope);
        let decoded = Codec::new().decode(&mut buffer).unwrap().unwrap();
        assert!(decoded.is_response());
        assert_eq!(decoded.ordinal(), 3);
    }

    #[test]
    fn partial_input_yields_nothing() {
        let mut payload = Frame::new();
        payload.write_u64(1);
        let full = encode(Envelope::request(INVOKE_LABEL, 1, payload));

        let mut codec = Codec::new();
        let mut buffer = BytesMut::new();

        // Feed the message one byte at a time; only the final byte completes
        // it.
        for (index, byte) in full.iter().enumerate() {
            buffer.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut buffer).unwrap();
            if index + 1 == full.len() {
                assert_eq!(decoded.unwrap().ordinal(), 1);
            } else {
                assert!(decoded.is_none());
            }
        }
    }

    #[test]
    fn two_messages_in_one_buffer() {
        let mut buffer = encode(Envelope::request(ANNOUNCE_LABEL, 1, Frame::new()));
        buffer.extend_from_slice(&encode(Envelope::request(INVOKE_LABEL, 2, Frame::new())));

        let mut codec = Codec::new();
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().ordinal(), 1);
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().ordinal(), 2);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn undersized_length_is_malformed() {
        let mut buffer = BytesMut::from(&[3u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            Codec::new().decode(&mut buffer),
            Err(CodecError::Malformed { length: 3 })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = Frame::from_vec(vec![0; usize::from(u16::MAX)]);
        let mut buffer = BytesMut::new();
        assert!(matches!(
            Codec::new().encode(Envelope::request(INVOKE_LABEL, 1, payload), &mut buffer),
            Err(CodecError::Oversized { .. })
        ));
    }
}
