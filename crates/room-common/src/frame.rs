//! Muxrpc packet framing.
//!
//! Every packet is a 9-byte header followed by the body:
//!
//! ```text
//! [flags: u8][body_len: u32 BE][req: i32 BE][body ...]
//! ```
//!
//! Flag bits: `0x08` stream, `0x04` end-or-error, `0x03` body type
//! (0 binary, 1 utf-8, 2 JSON). A header of nine zero bytes is the goodbye
//! that ends a session.

use thiserror::Error;

/// Size of the packet header.
pub const HEADER_LEN: usize = 9;
/// Upper bound on a single packet body.
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// Flag bit marking a packet as part of a stream.
pub const FLAG_STREAM: u8 = 0b1000;
/// Flag bit marking the last packet of a direction, or an error.
pub const FLAG_END_ERR: u8 = 0b0100;
/// Mask for the body type bits.
pub const TYPE_MASK: u8 = 0b0011;

/// Errors that can occur when parsing muxrpc packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the header or the announced body.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// Body exceeds [`MAX_BODY_LEN`].
    #[error("packet body too large: max {max} bytes, got {actual}")]
    BodyTooLarge {
        /// Allowed maximum.
        max: usize,
        /// Announced length.
        actual: usize,
    },
    /// The body type bits hold the reserved value 3.
    #[error("unknown body type: {0}")]
    UnknownBodyType(u8),
}

/// Encoding of a packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyType {
    /// Opaque bytes.
    Binary,
    /// UTF-8 text.
    Utf8,
    /// A JSON document.
    Json,
}

impl BodyType {
    const fn bits(self) -> u8 {
        match self {
            Self::Binary => 0,
            Self::Utf8 => 1,
            Self::Json => 2,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, FrameError> {
        match bits & TYPE_MASK {
            0 => Ok(Self::Binary),
            1 => Ok(Self::Utf8),
            2 => Ok(Self::Json),
            other => Err(FrameError::UnknownBodyType(other)),
        }
    }
}

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Packet belongs to a stream.
    pub stream: bool,
    /// Packet ends its direction (or carries an error).
    pub end_or_error: bool,
    /// Body encoding.
    pub body_type: BodyType,
    /// Body length in bytes.
    pub body_len: u32,
    /// Request number; negative for replies.
    pub req: i32,
}

impl Header {
    /// The all-zero header that says goodbye.
    pub const GOODBYE: [u8; HEADER_LEN] = [0u8; HEADER_LEN];

    /// Encode the header.
    ///
    /// # Examples
    ///
    /// ```
    /// use room_common::frame::{BodyType, Header};
    ///
    /// let header = Header {
    ///     stream: true,
    ///     end_or_error: false,
    ///     body_type: BodyType::Json,
    ///     body_len: 4,
    ///     req: -3,
    /// };
    /// let bytes = header.encode();
    /// assert_eq!(bytes[0], 0b1010);
    /// assert_eq!(Header::parse(&bytes).unwrap(), header);
    /// ```
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut flags = self.body_type.bits();
        if self.stream {
            flags |= FLAG_STREAM;
        }
        if self.end_or_error {
            flags |= FLAG_END_ERR;
        }
        let mut out = [0u8; HEADER_LEN];
        out[0] = flags;
        out[1..5].copy_from_slice(&self.body_len.to_be_bytes());
        out[5..9].copy_from_slice(&self.req.to_be_bytes());
        out
    }

    /// Parse a header from the first nine bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when `data` is short, the type bits are
    /// reserved or the body is larger than [`MAX_BODY_LEN`].
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::TooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let flags = data[0];
        let body_len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let req = i32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let len = body_len as usize;
        if len > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge {
                max: MAX_BODY_LEN,
                actual: len,
            });
        }
        Ok(Self {
            stream: flags & FLAG_STREAM != 0,
            end_or_error: flags & FLAG_END_ERR != 0,
            body_type: BodyType::from_bits(flags)?,
            body_len,
            req,
        })
    }

    /// True for the all-zero goodbye header.
    #[must_use]
    pub fn is_goodbye(&self) -> bool {
        self.req == 0
            && self.body_len == 0
            && !self.stream
            && !self.end_or_error
            && self.body_type == BodyType::Binary
    }
}

/// A complete muxrpc packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet belongs to a stream.
    pub stream: bool,
    /// Packet ends its direction (or carries an error).
    pub end_or_error: bool,
    /// Body encoding.
    pub body_type: BodyType,
    /// Request number; negative for replies.
    pub req: i32,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl Packet {
    /// Build a JSON packet.
    #[must_use]
    pub fn json(req: i32, stream: bool, end_or_error: bool, body: Vec<u8>) -> Self {
        Self {
            stream,
            end_or_error,
            body_type: BodyType::Json,
            req,
            body,
        }
    }

    /// The clean end of a stream direction: `true` with both flags set.
    #[must_use]
    pub fn end_of_stream(req: i32) -> Self {
        Self::json(req, true, true, b"true".to_vec())
    }

    /// Header describing this packet.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyTooLarge`] if the body does not fit.
    pub fn header(&self) -> Result<Header, FrameError> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge {
                max: MAX_BODY_LEN,
                actual: self.body.len(),
            });
        }
        Ok(Header {
            stream: self.stream,
            end_or_error: self.end_or_error,
            body_type: self.body_type,
            body_len: self.body.len() as u32,
            req: self.req,
        })
    }

    /// Serialize header and body into one buffer.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyTooLarge`] if the body does not fit.
    pub fn serialize(&self) -> Result<Vec<u8>, FrameError> {
        let header = self.header()?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Parse a full packet from `data`. Bytes past the body are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when the header is invalid or the body is cut.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(data)?;
        let end = HEADER_LEN + header.body_len as usize;
        if data.len() < end {
            return Err(FrameError::TooShort {
                expected: end,
                actual: data.len(),
            });
        }
        Ok(Self::from_parts(header, data[HEADER_LEN..end].to_vec()))
    }

    /// Combine a parsed header with its body.
    #[must_use]
    pub fn from_parts(header: Header, body: Vec<u8>) -> Self {
        Self {
            stream: header.stream,
            end_or_error: header.end_or_error,
            body_type: header.body_type,
            req: header.req,
            body,
        }
    }
}
