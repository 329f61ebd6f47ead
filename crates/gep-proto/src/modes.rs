//! Operational modes negotiated by `DefineOperationalModes`.
//!
//! The 32-bit bitmask carries independent subfields:
//!
//! ```text
//! bits 0-4   protocol version
//! bits 5-7   compression modes (GZip = bit 5, stateful codec = bit 6)
//! bits 8-9   text encoding
//! bit  24    use common serialization format
//! bit  25    receive external metadata
//! bit  26    receive internal metadata
//! bit  29    compress payload data
//! bit  30    compress signal index cache
//! bit  31    compress metadata
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::text::TextEncoding;

bitflags! {
    /// Operational modes bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OperationalModes: u32 {
        /// Protocol version subfield
        const VERSION_MASK = 0x0000_001F;
        /// Compression modes subfield
        const COMPRESSION_MODE_MASK = 0x0000_00E0;
        /// Text encoding subfield
        const ENCODING_MASK = 0x0000_0300;
        /// Common (cross-platform) serialization format
        const USE_COMMON_SERIALIZATION_FORMAT = 1 << 24;
        /// Send external metadata on refresh
        const RECEIVE_EXTERNAL_METADATA = 1 << 25;
        /// Send internal metadata on refresh
        const RECEIVE_INTERNAL_METADATA = 1 << 26;
        /// Compress data packet payloads
        const COMPRESS_PAYLOAD_DATA = 1 << 29;
        /// Compress signal index cache updates
        const COMPRESS_SIGNAL_INDEX_CACHE = 1 << 30;
        /// Compress metadata refresh responses
        const COMPRESS_METADATA = 1 << 31;
    }
}

bitflags! {
    /// Compression algorithms selected inside [`OperationalModes`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CompressionModes: u32 {
        /// General-purpose GZip for control payloads
        const GZIP = 1 << 5;
        /// Stateful codec for data payloads
        const STATEFUL = 1 << 6;
    }
}

impl OperationalModes {
    /// Create modes from a raw value; unknown bits are preserved.
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self::from_bits_retain(value)
    }

    /// Raw value
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self.bits()
    }

    /// Protocol version subfield
    #[must_use]
    pub const fn version(self) -> u8 {
        (self.bits() & Self::VERSION_MASK.bits()) as u8
    }

    /// Compression modes subfield
    #[must_use]
    pub const fn compression(self) -> CompressionModes {
        CompressionModes::from_bits_truncate(self.bits() & Self::COMPRESSION_MODE_MASK.bits())
    }

    /// Text encoding subfield
    #[must_use]
    pub const fn encoding(self) -> TextEncoding {
        TextEncoding::from_mode_bits(self.bits() & Self::ENCODING_MASK.bits())
    }

    /// Replace the text encoding subfield.
    #[must_use]
    pub const fn with_encoding(self, encoding: TextEncoding) -> Self {
        Self::from_bits_retain(
            (self.bits() & !Self::ENCODING_MASK.bits()) | encoding.to_mode_bits(),
        )
    }

    /// Replace the compression modes subfield.
    #[must_use]
    pub const fn with_compression(self, modes: CompressionModes) -> Self {
        Self::from_bits_retain(
            (self.bits() & !Self::COMPRESSION_MODE_MASK.bits())
                | (modes.bits() & Self::COMPRESSION_MODE_MASK.bits()),
        )
    }

    /// GZip applies to signal index cache updates
    #[must_use]
    pub const fn gzip_signal_index_cache(self) -> bool {
        self.contains(Self::COMPRESS_SIGNAL_INDEX_CACHE)
            && self.compression().contains(CompressionModes::GZIP)
    }

    /// GZip applies to metadata refresh responses
    #[must_use]
    pub const fn gzip_metadata(self) -> bool {
        self.contains(Self::COMPRESS_METADATA)
            && self.compression().contains(CompressionModes::GZIP)
    }
}

impl Default for OperationalModes {
    fn default() -> Self {
        Self::empty()
    }
}

/// Security mode of the publisher's command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SecurityMode {
    /// No authentication
    #[default]
    None,
    /// Certificate-authenticated transport; the transport reports the result
    Tls,
    /// Pre-shared secret authentication via `Authenticate`
    Gateway,
}

impl SecurityMode {
    /// Commands other than `Authenticate`/`DefineOperationalModes` require an
    /// authenticated connection
    #[must_use]
    pub const fn requires_authentication(self) -> bool {
        !matches!(self, Self::None)
    }
}
