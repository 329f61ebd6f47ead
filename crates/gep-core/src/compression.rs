//! Compression adapter.
//!
//! Two unrelated mechanisms share this module:
//!
//! - **GZip** wraps whole control payloads (signal index caches, catalog
//!   snapshots). Stateless, one call per payload.
//! - **Stateful codec** compresses data packet bodies across packets. The
//!   codec is pluggable through [`StatefulCodec`]. [`CompressionEncoder`] and
//!   [`CompressionDecoder`] prefix each body with a 16-bit sequence so the
//!   receiver can detect a missed packet.
//!
//! # Invariants
//!
//! - **Reset Announcement**: sequence 0 is reserved. The encoder emits 0 on
//!   the first packet after creation or [`CompressionEncoder::reset`], and the
//!   decoder resets its codec whenever it reads 0. Later sequences increment
//!   and skip 0 on wrap.
//!
//! - **Desync Is Recoverable**: a decoder that sees any other sequence than
//!   the one it expects refuses the packet with
//!   [`CompressionError::Desync`] and keeps refusing until a reset arrives.

use std::io::{Read, Write};

use bytes::{Buf, BufMut};
use flate2::{
    Compress, Compression, Decompress, FlushCompress, FlushDecompress, read::GzDecoder,
    write::GzEncoder,
};

use crate::error::CompressionError;

/// Default bound on decompressed control payloads
pub const DEFAULT_DECOMPRESS_LIMIT: usize = 64 * 1024 * 1024;

/// GZip-compress a control payload.
///
/// # Errors
///
/// Returns [`CompressionError::Gzip`] if the encoder fails.
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder.write_all(data).map_err(|e| CompressionError::Gzip(e.to_string()))?;
    encoder.finish().map_err(|e| CompressionError::Gzip(e.to_string()))
}

/// Decompress a GZip control payload, refusing output beyond `limit` bytes.
///
/// # Errors
///
/// Returns [`CompressionError::Gzip`] for corrupt input or
/// [`CompressionError::TooLarge`] when the output exceeds `limit`.
pub fn gzip_decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::Gzip(e.to_string()))?;

    if out.len() > limit {
        return Err(CompressionError::TooLarge { limit });
    }
    Ok(out)
}

/// Cross-packet compressor for data packet bodies.
///
/// Implementations keep state between calls: `decode` only understands
/// output of `encode` calls made since the same number of resets.
pub trait StatefulCodec: Send {
    /// Drop all cross-packet state.
    fn reset(&mut self);

    /// Compress one body.
    ///
    /// # Errors
    ///
    /// Returns [`CompressionError::Codec`] if compression fails.
    fn encode(&mut self, input: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompress one body.
    ///
    /// # Errors
    ///
    /// Returns [`CompressionError::Codec`] for input the current state cannot
    /// decode.
    fn decode(&mut self, input: &[u8]) -> Result<Vec<u8>, CompressionError>;
}

/// Raw deflate stream with a sync flush after every body.
///
/// The deflate window carries across packets, so repeated signal layouts
/// compress to a few bytes.
pub struct DeflateStreamCodec {
    compress: Compress,
    decompress: Decompress,
    limit: usize,
}

impl DeflateStreamCodec {
    /// Codec with the default output bound
    #[must_use]
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::default(), false),
            decompress: Decompress::new(false),
            limit: DEFAULT_DECOMPRESS_LIMIT,
        }
    }
}

impl Default for DeflateStreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeflateStreamCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateStreamCodec")
            .field("total_in", &self.compress.total_in())
            .field("total_out", &self.decompress.total_out())
            .finish()
    }
}

impl StatefulCodec for DeflateStreamCodec {
    fn reset(&mut self) {
        self.compress.reset();
        self.decompress.reset(false);
    }

    fn encode(&mut self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let start = self.compress.total_in();

        loop {
            #[allow(clippy::cast_possible_truncation)]
            let consumed = (self.compress.total_in() - start) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            self.compress
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| CompressionError::Codec(e.to_string()))?;

            #[allow(clippy::cast_possible_truncation)]
            let consumed = (self.compress.total_in() - start) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }

    fn decode(&mut self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::with_capacity(input.len() * 4 + 64);
        let start_in = self.decompress.total_in();

        loop {
            #[allow(clippy::cast_possible_truncation)]
            let consumed = (self.decompress.total_in() - start_in) as usize;
            if out.len() == out.capacity() {
                if out.len() >= self.limit {
                    return Err(CompressionError::TooLarge { limit: self.limit });
                }
                out.reserve(out.capacity().max(64));
            }

            let before = (self.decompress.total_in(), self.decompress.total_out());
            self.decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| CompressionError::Codec(e.to_string()))?;

            #[allow(clippy::cast_possible_truncation)]
            let consumed = (self.decompress.total_in() - start_in) as usize;
            let progressed = before != (self.decompress.total_in(), self.decompress.total_out());
            if consumed == input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            if !progressed && out.len() < out.capacity() {
                return Err(CompressionError::Codec("truncated deflate stream".to_string()));
            }
        }
    }
}

fn next_sequence(sequence: u16) -> u16 {
    match sequence.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Sender half: `[sequence: u16 BE][codec output]`
pub struct CompressionEncoder {
    codec: Box<dyn StatefulCodec>,
    next: u16,
}

impl CompressionEncoder {
    /// Encoder that announces a reset on its first packet
    #[must_use]
    pub fn new(codec: Box<dyn StatefulCodec>) -> Self {
        Self { codec, next: 0 }
    }

    /// Sequence the next body will carry
    #[must_use]
    pub const fn next_sequence(&self) -> u16 {
        self.next
    }

    /// Force a codec reset announcement on the next body.
    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// Compress one packet body.
    ///
    /// # Errors
    ///
    /// Propagates codec failures. The encoder resets itself so the next body
    /// starts a fresh stream.
    pub fn encode(&mut self, body: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let sequence = self.next;
        if sequence == 0 {
            self.codec.reset();
        }

        let compressed = match self.codec.encode(body) {
            Ok(compressed) => compressed,
            Err(err) => {
                self.next = 0;
                return Err(err);
            },
        };

        let mut out = Vec::with_capacity(2 + compressed.len());
        out.put_u16(sequence);
        out.extend_from_slice(&compressed);
        self.next = next_sequence(sequence);
        Ok(out)
    }
}

impl std::fmt::Debug for CompressionEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionEncoder").field("next", &self.next).finish_non_exhaustive()
    }
}

/// Receiver half of [`CompressionEncoder`]
pub struct CompressionDecoder {
    codec: Box<dyn StatefulCodec>,
    expected: Option<u16>,
}

impl CompressionDecoder {
    /// Decoder waiting for a reset announcement
    #[must_use]
    pub fn new(codec: Box<dyn StatefulCodec>) -> Self {
        Self { codec, expected: None }
    }

    /// Sequence the decoder accepts next (`None` until a reset arrives)
    #[must_use]
    pub const fn expected(&self) -> Option<u16> {
        self.expected
    }

    /// Forget the stream; only a reset announcement is accepted afterwards.
    pub fn reset(&mut self) {
        self.codec.reset();
        self.expected = None;
    }

    /// Decompress one packet body.
    ///
    /// # Errors
    ///
    /// Returns [`CompressionError::Desync`] when the sequence does not
    /// continue the stream, or codec failures (after which the decoder waits
    /// for a reset).
    pub fn decode(&mut self, mut src: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if src.len() < 2 {
            return Err(CompressionError::Codec("missing codec sequence".to_string()));
        }
        let sequence = src.get_u16();

        if sequence == 0 {
            self.codec.reset();
        } else if self.expected != Some(sequence) {
            return Err(CompressionError::Desync { expected: self.expected, actual: sequence });
        }

        match self.codec.decode(src) {
            Ok(body) => {
                self.expected = Some(next_sequence(sequence));
                Ok(body)
            },
            Err(err) => {
                self.expected = None;
                Err(err)
            },
        }
    }
}

impl std::fmt::Debug for CompressionDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionDecoder").field("expected", &self.expected).finish_non_exhaustive()
    }
}
