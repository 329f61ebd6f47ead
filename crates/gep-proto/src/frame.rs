//! Command and response frames.
//!
//! - [`CommandFrame`]: client to server, `[command:1][payload]`
//! - [`ResponseFrame`]: server to client, `[ResponseHeader: 6 bytes][payload]`
//!
//! Both are pure data holders. Typed payloads live in [`crate::payloads`].

use bytes::{BufMut, Bytes};

use crate::{
    ResponseHeader, ServerCommand, ServerResponse,
    errors::{ProtocolError, Result},
};

/// Server-to-client frame
///
/// # Invariants
///
/// - **Size Consistency**: `payload.len()` MUST match `header.payload_size()`.
///   [`ResponseFrame::new`] sets the length from the payload, and
///   [`ResponseFrame::decode`] reads exactly that many bytes.
///
/// - **Empty Payloads Keep Their Length**: a zero-length payload is encoded as
///   a header with length 0, never as a missing length.
///
/// - **Size Limit**: `payload.len()` MUST NOT exceed
///   [`ResponseHeader::MAX_PAYLOAD_SIZE`]; [`ResponseFrame::encode`] rejects
///   oversized frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Response header
    pub header: ResponseHeader,

    /// Raw payload bytes
    pub payload: Bytes,
}

impl ResponseFrame {
    /// Create a frame, setting the header's payload size from `payload`.
    #[must_use]
    pub fn new(mut header: ResponseHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        #[allow(clippy::cast_possible_truncation)]
        {
            header.payload_size = (payload.len() as u32).to_be_bytes();
        }

        Self { header, payload }
    }

    /// Frame for `response` answering `in_reply_to`
    #[must_use]
    pub fn reply(response: ServerResponse, in_reply_to: ServerCommand, payload: impl Into<Bytes>) -> Self {
        Self::new(ResponseHeader::new(response, in_reply_to), payload)
    }

    /// Response code as an enum (if known)
    #[must_use]
    pub fn response(&self) -> Option<ServerResponse> {
        self.header.response()
    }

    /// Encoded size of the frame
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ResponseHeader::SIZE + self.payload.len()
    }

    /// Write `[header][payload]`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    /// [`ResponseHeader::MAX_PAYLOAD_SIZE`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > ResponseHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: ResponseHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Parse a frame from wire bytes. Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid or the payload is shorter
    /// than the header claims.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = ResponseHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = ResponseHeader::SIZE + payload_size;

        if bytes.len() < total_size {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(ResponseHeader::SIZE),
            });
        }

        let payload = Bytes::copy_from_slice(&bytes[ResponseHeader::SIZE..total_size]);

        Ok(Self { header: *header, payload })
    }
}

/// Client-to-server frame
///
/// The command byte is kept raw so unknown codes survive decoding and can be
/// answered with `Failed` by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    code: u8,

    /// Raw payload bytes
    pub payload: Bytes,
}

impl CommandFrame {
    /// Frame carrying `command`
    #[must_use]
    pub fn new(command: ServerCommand, payload: impl Into<Bytes>) -> Self {
        Self { code: command.to_u8(), payload: payload.into() }
    }

    /// Frame with an arbitrary command byte
    #[must_use]
    pub fn from_raw(code: u8, payload: impl Into<Bytes>) -> Self {
        Self { code, payload: payload.into() }
    }

    /// Raw command byte
    #[must_use]
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Command as an enum (if known)
    #[must_use]
    pub fn command(&self) -> Option<ServerCommand> {
        ServerCommand::from_u8(self.code)
    }

    /// Write `[command][payload]`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] above
    /// [`ResponseHeader::MAX_PAYLOAD_SIZE`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > ResponseHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: ResponseHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_u8(self.code);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Parse a command frame. The payload is everything after the first byte.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooShort`] for empty input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&code, payload) =
            bytes.split_first().ok_or(ProtocolError::FrameTooShort { expected: 1, actual: 0 })?;
        Ok(Self { code, payload: Bytes::copy_from_slice(payload) })
    }
}
