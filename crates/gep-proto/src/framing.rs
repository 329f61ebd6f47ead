//! Payload-aware stream framing.
//!
//! Stream transports carry frames as `[AA BB CC DD][len: u32 LE][frame]`.
//! The marker lets a reader detect (and skip past) garbage instead of
//! trusting an arbitrary length word.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Frame marker
pub const MARKER: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];

/// Marker plus length word
pub const PREFIX_SIZE: usize = 8;

/// Largest frame accepted on a stream (16 MiB)
pub const MAX_FRAMED_LEN: usize = 16 * 1024 * 1024;

/// Prefix `frame` with the marker and little-endian length.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] above [`MAX_FRAMED_LEN`].
pub fn encode_framed(frame: &[u8], dst: &mut impl BufMut) -> Result<()> {
    if frame.len() > MAX_FRAMED_LEN {
        return Err(ProtocolError::PayloadTooLarge { size: frame.len(), max: MAX_FRAMED_LEN });
    }
    dst.put_slice(&MARKER);
    #[allow(clippy::cast_possible_truncation)]
    dst.put_u32_le(frame.len() as u32);
    dst.put_slice(frame);
    Ok(())
}

/// Incremental decoder for a framed byte stream
///
/// Feed bytes with [`FrameReader::extend`] and pull complete frames with
/// [`FrameReader::next_frame`].
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    /// Empty reader
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as frames
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidMarker`] when the buffer does not start with
    ///   the marker. Bytes up to the next marker candidate are discarded, so
    ///   calling again resumes at the next plausible frame.
    /// - [`ProtocolError::PayloadTooLarge`] when the length word exceeds
    ///   [`MAX_FRAMED_LEN`]. The marker is discarded.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < MARKER.len() {
            return Ok(None);
        }

        if self.buf[..4] != MARKER {
            let mut found = [0u8; 4];
            found.copy_from_slice(&self.buf[..4]);
            let skip = (1..self.buf.len())
                .find(|&i| self.buf[i] == MARKER[0])
                .unwrap_or(self.buf.len());
            self.buf.advance(skip);
            return Err(ProtocolError::InvalidMarker(found));
        }

        if self.buf.len() < PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if len > MAX_FRAMED_LEN {
            self.buf.advance(MARKER.len());
            return Err(ProtocolError::PayloadTooLarge { size: len, max: MAX_FRAMED_LEN });
        }

        if self.buf.len() < PREFIX_SIZE + len {
            return Ok(None);
        }

        self.buf.advance(PREFIX_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}
