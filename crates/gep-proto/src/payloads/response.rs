//! Response payloads (server to client).
//!
//! Payloads whose content is owned by `gep-core` (sealed cipher keys,
//! compressed signal index caches, catalog snapshots) are opaque bytes here.

use bytes::{Buf, BufMut, Bytes};

use crate::{
    Ticks,
    errors::{ProtocolError, Result},
};

/// `Notify` payload: `[hash: u32 BE][encoded text]`
///
/// The hash identifies the notification in `ConfirmNotification`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Hash of the encoded text
    pub hash: u32,
    /// Text in the session's encoding
    pub encoded_text: Bytes,
}

impl Notification {
    /// Serialize the payload.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.hash);
        dst.put_slice(&self.encoded_text);
    }

    /// Parse the payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooShort`] for fewer than 4 bytes.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < 4 {
            return Err(ProtocolError::PayloadTooShort {
                context: "notification",
                expected: 4,
                actual: src.len(),
            });
        }
        let hash = src.get_u32();
        Ok(Self { hash, encoded_text: Bytes::copy_from_slice(src) })
    }
}

/// `BufferBlock` payload: `[sequence: u32 BE][runtime_index: u16 BE][data]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferBlock {
    /// Per-subscription sequence number
    pub sequence: u32,
    /// Runtime index of the block's signal
    pub runtime_index: u16,
    /// Raw block bytes
    pub data: Bytes,
}

impl BufferBlock {
    /// Size of the sequence and index prefix
    pub const PREFIX_SIZE: usize = 6;

    /// Serialize the payload.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.sequence);
        dst.put_u16(self.runtime_index);
        dst.put_slice(&self.data);
    }

    /// Serialize into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::PREFIX_SIZE + self.data.len());
        self.encode(&mut buf);
        buf.into()
    }

    /// Parse the payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooShort`] below the 6-byte prefix.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < Self::PREFIX_SIZE {
            return Err(ProtocolError::PayloadTooShort {
                context: "buffer block",
                expected: Self::PREFIX_SIZE,
                actual: src.len(),
            });
        }
        let sequence = src.get_u32();
        let runtime_index = src.get_u16();
        Ok(Self { sequence, runtime_index, data: Bytes::copy_from_slice(src) })
    }
}

/// `DataStartTime` payload: `[ticks: i64 BE]`
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooShort`] for fewer than 8 bytes.
pub fn decode_start_time(mut src: &[u8]) -> Result<Ticks> {
    if src.len() < 8 {
        return Err(ProtocolError::PayloadTooShort {
            context: "data start time",
            expected: 8,
            actual: src.len(),
        });
    }
    Ok(Ticks(src.get_i64()))
}

/// Serialize a `DataStartTime` payload.
#[must_use]
pub fn encode_start_time(start: Ticks) -> Bytes {
    Bytes::copy_from_slice(&start.0.to_be_bytes())
}
