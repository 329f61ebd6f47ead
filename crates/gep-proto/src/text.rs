//! Text encodings selectable through operational modes.
//!
//! Every string on the wire (response messages, connection strings,
//! authentication text, notifications) uses the session's negotiated
//! encoding. Until `DefineOperationalModes` arrives the all-zero bitmask
//! applies, which selects UTF-16LE.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Wire text encoding (operational-mode bits 8-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TextEncoding {
    /// `00`: UTF-16, little-endian code units
    #[default]
    Utf16Le,
    /// `01`: UTF-16, big-endian code units
    Utf16Be,
    /// `10`: UTF-8
    Utf8,
    /// `11`: single-byte ANSI, handled as ISO-8859-1
    Ansi,
}

impl TextEncoding {
    /// Decode from the masked mode bits (`value & 0x300`).
    #[must_use]
    pub const fn from_mode_bits(masked: u32) -> Self {
        match (masked >> 8) & 0b11 {
            0b00 => Self::Utf16Le,
            0b01 => Self::Utf16Be,
            0b10 => Self::Utf8,
            _ => Self::Ansi,
        }
    }

    /// Encode into mode bits (already shifted into bits 8-9).
    #[must_use]
    pub const fn to_mode_bits(self) -> u32 {
        let selector = match self {
            Self::Utf16Le => 0b00,
            Self::Utf16Be => 0b01,
            Self::Utf8 => 0b10,
            Self::Ansi => 0b11,
        };
        selector << 8
    }

    /// Human-readable name, used in error messages
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Utf16Le => "UTF-16LE",
            Self::Utf16Be => "UTF-16BE",
            Self::Utf8 => "UTF-8",
            Self::Ansi => "ANSI",
        }
    }

    /// Encode `text` into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Unrepresentable`] for ANSI text containing
    /// characters above U+00FF.
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(text.len() * 2);
        match self {
            Self::Utf8 => out.extend_from_slice(text.as_bytes()),
            Self::Utf16Le => text.encode_utf16().for_each(|unit| out.put_u16_le(unit)),
            Self::Utf16Be => text.encode_utf16().for_each(|unit| out.put_u16(unit)),
            Self::Ansi => {
                for ch in text.chars() {
                    let byte = u8::try_from(u32::from(ch))
                        .map_err(|_| ProtocolError::Unrepresentable { encoding: self.name() })?;
                    out.push(byte);
                }
            },
        }
        Ok(out)
    }

    /// Decode `bytes` into a `String`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidText`] for invalid UTF-8, odd-length or
    /// unpaired-surrogate UTF-16.
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        let invalid = || ProtocolError::InvalidText { encoding: self.name() };
        match self {
            Self::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| invalid()),
            Self::Utf16Le | Self::Utf16Be => {
                if bytes.len() % 2 != 0 {
                    return Err(invalid());
                }
                let mut buf = bytes;
                let mut units = Vec::with_capacity(bytes.len() / 2);
                while buf.has_remaining() {
                    units.push(if self == Self::Utf16Le { buf.get_u16_le() } else { buf.get_u16() });
                }
                String::from_utf16(&units).map_err(|_| invalid())
            },
            Self::Ansi => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }

    /// Write `[len: u32 BE][encoded text]`.
    ///
    /// # Errors
    ///
    /// Propagates [`TextEncoding::encode`] failures.
    pub fn put_prefixed(self, dst: &mut impl BufMut, text: &str) -> Result<()> {
        let encoded = self.encode(text)?;
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(encoded.len() as u32);
        dst.put_slice(&encoded);
        Ok(())
    }

    /// Read `[len: u32 BE][encoded text]`, advancing `src`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooShort`] when the declared length
    /// overruns the buffer, or a decode error.
    pub fn get_prefixed(self, src: &mut &[u8], context: &'static str) -> Result<String> {
        if src.len() < 4 {
            return Err(ProtocolError::PayloadTooShort { context, expected: 4, actual: src.len() });
        }
        let len = src.get_u32() as usize;
        if src.len() < len {
            return Err(ProtocolError::PayloadTooShort {
                context,
                expected: len,
                actual: src.len(),
            });
        }
        let text = self.decode(&src[..len])?;
        src.advance(len);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn utf16_byte_orders() {
        assert_eq!(TextEncoding::Utf16Le.encode("A").unwrap(), vec![0x41, 0x00]);
        assert_eq!(TextEncoding::Utf16Be.encode("A").unwrap(), vec![0x00, 0x41]);
    }

    #[test]
    fn ansi_rejects_wide_characters() {
        assert_eq!(TextEncoding::Ansi.encode("café").unwrap(), vec![0x63, 0x61, 0x66, 0xE9]);
        assert!(matches!(
            TextEncoding::Ansi.encode("€"),
            Err(ProtocolError::Unrepresentable { .. })
        ));
    }

    #[test]
    fn odd_utf16_is_invalid() {
        assert!(matches!(
            TextEncoding::Utf16Le.decode(&[0x41, 0x00, 0x42]),
            Err(ProtocolError::InvalidText { encoding: "UTF-16LE" })
        ));
    }

    #[test]
    fn prefixed_text_reports_truncation() {
        let mut buf: &[u8] = &[0, 0, 0, 9, b'a'];
        let result = TextEncoding::Utf8.get_prefixed(&mut buf, "message");
        assert_eq!(
            result,
            Err(ProtocolError::PayloadTooShort { context: "message", expected: 9, actual: 1 })
        );
    }

    #[test]
    fn mode_bits_cover_all_selectors() {
        for encoding in
            [TextEncoding::Utf16Le, TextEncoding::Utf16Be, TextEncoding::Utf8, TextEncoding::Ansi]
        {
            assert_eq!(TextEncoding::from_mode_bits(encoding.to_mode_bits()), encoding);
        }
    }

    proptest! {
        #[test]
        fn unicode_encodings_preserve_text(text in "\\PC{0,64}") {
            for encoding in [TextEncoding::Utf16Le, TextEncoding::Utf16Be, TextEncoding::Utf8] {
                let mut wire = Vec::new();
                encoding.put_prefixed(&mut wire, &text).unwrap();
                let mut src = wire.as_slice();
                prop_assert_eq!(encoding.get_prefixed(&mut src, "text").unwrap(), text.clone());
                prop_assert!(src.is_empty());
            }
        }
    }
}
