//! Growable payload buffer with append-only writers and positional readers.
//!
//! A frame never carries its own size; the enclosing [`Envelope`](crate::Envelope)
//! does. Nothing here validates semantics, only shape.

use std::fmt;

use crate::ids::{InstanceId, RawInstance};

/// Decoding failure for a frame payload.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    /// The payload ended before the expected field.
    #[error("frame truncated at byte {at}")]
    Truncated {
        /// Read position at which data ran out.
        at: usize,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidText(#[from] std::str::Utf8Error),

    /// A blob was larger than its 16-bit length prefix allows.
    #[error("blob of {len} bytes exceeds the 16-bit length prefix")]
    Oversized {
        /// Attempted blob length.
        len: usize,
    },

    /// A discriminator field held a value outside its domain.
    #[error("invalid discriminator value {value}")]
    InvalidDiscriminator {
        /// The offending wire value.
        value: u8,
    },

    /// A string field contained an interior NUL byte.
    #[error("interior nul byte in string field")]
    InteriorNul,
}

/// An append-only byte buffer holding one message payload.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({} bytes)", self.data.len())
    }
}

impl Frame {
    /// Returns a new empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already-encoded payload.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Consumes the frame, returning the raw payload.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// The encoded payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of encoded bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends a `u8`.
    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Appends a `u16`, little-endian.
    pub fn write_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a `u32`, little-endian.
    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a `u64`, little-endian.
    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an instance handle at the build-selected width.
    pub fn write_instance(&mut self, instance: InstanceId) {
        self.data.extend_from_slice(&instance.to_raw().to_le_bytes());
    }

    /// Appends a NUL-terminated UTF-8 string.
    ///
    /// Interior NULs would corrupt the framing and are rejected.
    pub fn write_string(&mut self, value: &str) -> Result<(), FrameError> {
        if value.bytes().any(|byte| byte == 0) {
            return Err(FrameError::InteriorNul);
        }
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        Ok(())
    }

    /// Appends a byte blob with a 16-bit length prefix.
    pub fn write_blob(&mut self, value: &[u8]) -> Result<(), FrameError> {
        let len =
            u16::try_from(value.len()).map_err(|_| FrameError::Oversized { len: value.len() })?;
        self.write_u16(len);
        self.data.extend_from_slice(value);
        Ok(())
    }

    /// Appends raw bytes with no prefix; the reader must know the shape.
    pub fn write_raw(&mut self, value: &[u8]) {
        self.data.extend_from_slice(value);
    }

    /// Returns a positional reader over the payload.
    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader {
            data: &self.data,
            position: 0,
        }
    }
}

/// Positional reader over a [`Frame`].
#[derive(Debug)]
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], FrameError> {
        let end = self.position.checked_add(count).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.position..end];
                self.position = end;
                Ok(slice)
            }
            None => Err(FrameError::Truncated { at: self.position }),
        }
    }

    /// Reads a `u8`.
    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("sized take")))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("sized take")))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("sized take")))
    }

    /// Reads an instance handle at the build-selected width.
    pub fn read_instance(&mut self) -> Result<InstanceId, FrameError> {
        let bytes: [u8; InstanceId::WIDTH] =
            self.take(InstanceId::WIDTH)?.try_into().expect("sized take");
        Ok(InstanceId::from_raw(RawInstance::from_le_bytes(bytes)))
    }

    /// Reads a NUL-terminated UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, FrameError> {
        let rest = &self.data[self.position..];
        let nul = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(FrameError::Truncated { at: self.data.len() })?;
        let text = std::str::from_utf8(&rest[..nul])?.to_owned();
        self.position += nul + 1;
        Ok(text)
    }

    /// Reads a byte blob with a 16-bit length prefix.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = usize::from(self.read_u16()?);
        Ok(self.take(len)?.to_vec())
    }

    /// Reads exactly `count` raw bytes.
    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8], FrameError> {
        self.take(count)
    }

    /// Returns every byte not yet consumed, advancing to the end.
    pub fn remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.position..];
        self.position = self.data.len();
        rest
    }

    /// Whether every byte has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.position == self.data.len()
    }
}
