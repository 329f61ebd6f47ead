//! Response header implementation with zero-copy parsing.
//!
//! Every server-to-client frame starts with a fixed 6-byte header:
//! response code, the command it answers, and a Big Endian payload length.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    ServerCommand, ServerResponse,
    errors::{ProtocolError, Result},
};

/// Fixed 6-byte response header (Big Endian network byte order)
///
/// Layout: `[response_code:1][in_reply_to:1][payload_size:4 BE]`.
///
/// Fields are stored as raw bytes so the struct has alignment 1 and every
/// 6-byte pattern is a valid header.
///
/// # Security Properties
///
/// - **Zero-Copy Safety**: `zerocopy` verifies the layout at compile time, so
///   casting untrusted network bytes cannot produce undefined behavior.
///
/// - **Codes Are Not Validated Here**: Unknown response or command codes are
///   preserved as raw bytes. Callers decide whether to reject them via
///   [`ResponseHeader::response`] and [`ResponseHeader::in_reply_to`].
///
/// - **Bounded Payload**: [`ResponseHeader::from_bytes`] rejects payload sizes
///   above [`ResponseHeader::MAX_PAYLOAD_SIZE`] before any allocation.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ResponseHeader {
    pub(crate) code: u8,
    pub(crate) in_reply_to: u8,
    pub(crate) payload_size: [u8; 4],
}

impl ResponseHeader {
    /// Size of the serialized header (6 bytes)
    pub const SIZE: usize = 6;

    /// Maximum payload size (16 MB)
    pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

    /// Create a header for `response` answering `in_reply_to` with an empty
    /// payload.
    #[must_use]
    pub fn new(response: ServerResponse, in_reply_to: ServerCommand) -> Self {
        Self::from_raw(response.to_u8(), in_reply_to.to_u8())
    }

    /// Create a header from raw code bytes.
    ///
    /// Used when answering an unrecognized command, where the in-reply-to
    /// byte has no [`ServerCommand`] variant.
    #[must_use]
    pub const fn from_raw(code: u8, in_reply_to: u8) -> Self {
        Self { code, in_reply_to, payload_size: [0; 4] }
    }

    /// Parse header from network bytes (zero-copy, safe)
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if:
    /// - Buffer is too short (< 6 bytes)
    /// - Payload size exceeds maximum
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        let payload_size = header.payload_size();
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes (zero-copy)
    #[must_use]
    #[allow(clippy::wrong_self_convention)] // Common serialization pattern
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Raw response code byte
    #[must_use]
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Response code as an enum (if known)
    #[must_use]
    pub fn response(&self) -> Option<ServerResponse> {
        ServerResponse::from_u8(self.code)
    }

    /// Raw in-reply-to command byte
    #[must_use]
    pub fn in_reply_to_code(&self) -> u8 {
        self.in_reply_to
    }

    /// In-reply-to command as an enum (if known)
    #[must_use]
    pub fn in_reply_to(&self) -> Option<ServerCommand> {
        ServerCommand::from_u8(self.in_reply_to)
    }

    /// Get the payload size
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for ResponseHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHeader")
            .field("code", &format!("{:#04x}", self.code))
            .field("in_reply_to", &format!("{:#04x}", self.in_reply_to))
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for ResponseHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for ResponseHeader {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for ResponseHeader {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
            (any::<u8>(), any::<u8>(), 0u32..=ResponseHeader::MAX_PAYLOAD_SIZE)
                .prop_map(|(code, in_reply_to, payload_size)| ResponseHeader {
                    code,
                    in_reply_to,
                    payload_size: payload_size.to_be_bytes(),
                })
                .boxed()
        }
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<ResponseHeader>(), ResponseHeader::SIZE);
        assert_eq!(ResponseHeader::SIZE, 6);
    }

    #[test]
    fn header_layout_is_code_reply_length() {
        let mut header = ResponseHeader::new(ServerResponse::Failed, ServerCommand::Subscribe);
        header.payload_size = 0x0102_0304u32.to_be_bytes();

        assert_eq!(header.to_bytes(), [0x81, 0x02, 0x01, 0x02, 0x03, 0x04]);
    }

    proptest! {
        #[test]
        fn header_round_trip(header in any::<ResponseHeader>()) {
            let bytes = header.to_bytes();
            let parsed = ResponseHeader::from_bytes(&bytes).expect("should parse");
            prop_assert_eq!(&header, parsed);
        }

        #[test]
        fn header_accessors(header in any::<ResponseHeader>()) {
            prop_assert!(header.payload_size() <= ResponseHeader::MAX_PAYLOAD_SIZE);
            prop_assert_eq!(header.response().map(ServerResponse::to_u8).unwrap_or(header.code()), header.code());
        }
    }

    #[test]
    fn reject_short_buffer() {
        let result = ResponseHeader::from_bytes(&[0x80, 0x02, 0x00]);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 6, actual: 3 }));
    }

    #[test]
    fn reject_oversized_payload() {
        let mut buf = [0x82u8, 0x02, 0, 0, 0, 0];
        buf[2..6].copy_from_slice(&(ResponseHeader::MAX_PAYLOAD_SIZE + 1).to_be_bytes());

        let result = ResponseHeader::from_bytes(&buf);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let buf = [0x42u8, 0xC3, 0, 0, 0, 0];
        let header = ResponseHeader::from_bytes(&buf).expect("any codes parse");

        assert_eq!(header.code(), 0x42);
        assert_eq!(header.response(), None);
        assert_eq!(header.in_reply_to(), None);
        assert_eq!(header.in_reply_to_code(), 0xC3);
    }
}
