//! Command payloads (client to server).

use bytes::{Buf, BufMut, Bytes};

use crate::{
    DataPacketFlags, TextEncoding,
    errors::{ProtocolError, Result},
};

/// `Subscribe` payload: `[flags:1][len: u32 BE][connection string]`
///
/// The flags byte requests compact and/or synchronized delivery; the
/// connection string carries the subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// Requested packet flags (only `COMPACT` and `SYNCHRONIZED` are meaningful)
    pub flags: DataPacketFlags,
    /// `key=value;...` subscription settings
    pub connection_string: String,
}

impl SubscribeRequest {
    /// Smallest accepted payload
    pub const MIN_SIZE: usize = 6;

    /// Whether compact format was requested
    #[must_use]
    pub fn compact(&self) -> bool {
        self.flags.contains(DataPacketFlags::COMPACT)
    }

    /// Whether synchronized delivery was requested
    #[must_use]
    pub fn synchronized(&self) -> bool {
        self.flags.contains(DataPacketFlags::SYNCHRONIZED)
    }

    pub(crate) fn encode(&self, encoding: TextEncoding, dst: &mut impl BufMut) -> Result<()> {
        dst.put_u8(self.flags.to_byte());
        encoding.put_prefixed(dst, &self.connection_string)
    }

    pub(crate) fn decode(mut src: &[u8], encoding: TextEncoding) -> Result<Self> {
        if src.len() < Self::MIN_SIZE {
            return Err(ProtocolError::PayloadTooShort {
                context: "subscribe",
                expected: Self::MIN_SIZE,
                actual: src.len(),
            });
        }
        let flags = DataPacketFlags::from_byte(src.get_u8());
        let connection_string = encoding.get_prefixed(&mut src, "subscribe")?;
        Ok(Self { flags, connection_string })
    }
}

/// `Authenticate` payload: `[len: u32 BE][sealed token]`
///
/// # Security
///
/// - **Debug Redaction**: the token is never printed.
/// - **Bounded**: token length must be within
///   [`AuthenticateRequest::MIN_TOKEN`]`..=`[`AuthenticateRequest::MAX_TOKEN`].
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticateRequest {
    /// Token sealed with the connection's shared secret
    pub token: Bytes,
}

impl AuthenticateRequest {
    /// Shortest accepted sealed token
    pub const MIN_TOKEN: usize = 16;

    /// Longest accepted sealed token
    pub const MAX_TOKEN: usize = 256;

    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(self.token.len() as u32);
        dst.put_slice(&self.token);
    }

    pub(crate) fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < 4 {
            return Err(ProtocolError::PayloadTooShort {
                context: "authenticate",
                expected: 4,
                actual: src.len(),
            });
        }
        let len = src.get_u32() as usize;
        if !(Self::MIN_TOKEN..=Self::MAX_TOKEN).contains(&len) {
            return Err(ProtocolError::LengthOutOfRange {
                context: "authentication token",
                length: len,
                min: Self::MIN_TOKEN,
                max: Self::MAX_TOKEN,
            });
        }
        if src.len() < len {
            return Err(ProtocolError::PayloadTooShort {
                context: "authenticate",
                expected: len,
                actual: src.len(),
            });
        }
        Ok(Self { token: Bytes::copy_from_slice(&src[..len]) })
    }
}

impl std::fmt::Debug for AuthenticateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticateRequest")
            .field("token", &format!("<redacted {} bytes>", self.token.len()))
            .finish()
    }
}

/// `MetaDataRefresh` payload: optional `[len: u32 BE][filter expression]`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataRefreshRequest {
    /// Filter expressions applied by the metadata provider
    pub filter: Option<String>,
}

impl MetadataRefreshRequest {
    pub(crate) fn encode(&self, encoding: TextEncoding, dst: &mut impl BufMut) -> Result<()> {
        match &self.filter {
            Some(filter) => encoding.put_prefixed(dst, filter),
            None => Ok(()),
        }
    }

    pub(crate) fn decode(mut src: &[u8], encoding: TextEncoding) -> Result<Self> {
        if src.len() < 4 {
            return Ok(Self::default());
        }
        let filter = encoding.get_prefixed(&mut src, "metadata refresh")?;
        Ok(Self { filter: Some(filter).filter(|f| !f.is_empty()) })
    }
}

pub(crate) fn get_u32(src: &[u8], context: &'static str) -> Result<u32> {
    let mut src = src;
    if src.len() < 4 {
        return Err(ProtocolError::PayloadTooShort { context, expected: 4, actual: src.len() });
    }
    Ok(src.get_u32())
}
