//! `DataPacket` body layout.
//!
//! ```text
//! [flags:1] | [frame_timestamp: i64 BE, synchronized only][count: u32 BE][body]
//! ```
//!
//! Everything right of the bar is what the session seals when cipher keys
//! exist; `body` is what the stateful codec compresses. This module only
//! deals with the plain form: flags, prelude and measurement encodings.

use bytes::{Buf, BufMut, Bytes};

use crate::{
    DataPacketFlags, Measurement, Ticks,
    compact::CompactContext,
    errors::{ProtocolError, Result},
};

/// Upper bound on encoded measurement bytes per packet
pub const MAX_PACKET_SIZE: usize = 32_767;

/// Frame timestamp and measurement count that precede the body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketPrelude {
    /// Timestamp of a synchronized frame
    pub frame_timestamp: Option<Ticks>,
    /// Number of measurements in the body
    pub count: u32,
}

impl PacketPrelude {
    /// Serialize the prelude.
    pub fn encode(&self, dst: &mut impl BufMut) {
        if let Some(timestamp) = self.frame_timestamp {
            dst.put_i64(timestamp.0);
        }
        dst.put_u32(self.count);
    }

    /// Parse the prelude of a packet with the given flags, advancing `src`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooShort`] on truncated input.
    pub fn decode(flags: DataPacketFlags, src: &mut &[u8]) -> Result<Self> {
        let synchronized = flags.contains(DataPacketFlags::SYNCHRONIZED);
        let needed = if synchronized { 12 } else { 4 };
        if src.len() < needed {
            return Err(ProtocolError::PayloadTooShort {
                context: "data packet",
                expected: needed,
                actual: src.len(),
            });
        }

        let frame_timestamp = synchronized.then(|| Ticks(src.get_i64()));
        Ok(Self { frame_timestamp, count: src.get_u32() })
    }
}

/// How measurements are laid out in the body
#[derive(Debug, Clone, Copy)]
pub enum MeasurementFormat<'a> {
    /// 36-byte full measurements
    Full,
    /// Compact measurements against a signal index cache
    Compact(CompactContext<'a>),
}

impl MeasurementFormat<'_> {
    /// Encoded size of `measurement`
    #[must_use]
    pub fn encoded_len(&self, measurement: &Measurement) -> usize {
        match self {
            Self::Full => Measurement::FULL_SIZE,
            Self::Compact(ctx) => ctx.encoded_len(measurement),
        }
    }

    /// Append one measurement.
    ///
    /// # Errors
    ///
    /// Propagates compact-format mapping failures.
    pub fn encode(&self, measurement: &Measurement, dst: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Full => {
                measurement.encode_full(dst);
                Ok(())
            },
            Self::Compact(ctx) => ctx.encode(measurement, dst),
        }
    }

    /// Decode exactly `count` measurements from `src`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CountMismatch`] when the body runs out early,
    /// or the underlying decode error.
    pub fn decode_all(&self, mut src: &[u8], count: u32, default_time: Ticks) -> Result<Vec<Measurement>> {
        let declared = count as usize;
        let mut measurements = Vec::with_capacity(declared.min(MAX_PACKET_SIZE / 7));

        while measurements.len() < declared {
            if src.is_empty() {
                return Err(ProtocolError::CountMismatch { declared, parsed: measurements.len() });
            }
            let measurement = match self {
                Self::Full => Measurement::decode_full(&mut src)?,
                Self::Compact(ctx) => ctx.decode(&mut src, default_time)?,
            };
            measurements.push(measurement);
        }

        Ok(measurements)
    }
}

/// Split `measurements` into runs whose encoded size stays within
/// [`MAX_PACKET_SIZE`].
///
/// A single measurement always forms at least a run of one.
#[must_use]
pub fn split_batches<'m>(
    measurements: &'m [Measurement],
    format: &MeasurementFormat<'_>,
) -> Vec<&'m [Measurement]> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut size = 0;

    for (i, measurement) in measurements.iter().enumerate() {
        let len = format.encoded_len(measurement);
        if i > start && size + len > MAX_PACKET_SIZE {
            runs.push(&measurements[start..i]);
            start = i;
            size = 0;
        }
        size += len;
    }
    if start < measurements.len() {
        runs.push(&measurements[start..]);
    }
    runs
}

/// An unsealed, uncompressed data packet
#[derive(Debug, Clone, PartialEq)]
pub struct PlainDataPacket {
    /// Packet flags
    pub flags: DataPacketFlags,
    /// Frame timestamp for synchronized packets
    pub frame_timestamp: Option<Ticks>,
    /// Measurements in wire order
    pub measurements: Vec<Measurement>,
}

impl PlainDataPacket {
    /// Serialize to a `DataPacket` response payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidFlags`] if the flags claim encryption
    /// or compression, or a measurement encode error.
    pub fn encode(&self, format: &MeasurementFormat<'_>) -> Result<Bytes> {
        let flags = self.flags;
        if flags.intersects(DataPacketFlags::CIPHER_INDEX | DataPacketFlags::COMPRESSED) {
            return Err(ProtocolError::InvalidFlags(flags.to_byte()));
        }

        let mut buf = Vec::with_capacity(13 + self.measurements.len() * 16);
        buf.put_u8(flags.to_byte());
        #[allow(clippy::cast_possible_truncation)]
        PacketPrelude { frame_timestamp: self.frame_timestamp, count: self.measurements.len() as u32 }
            .encode(&mut buf);
        for measurement in &self.measurements {
            format.encode(measurement, &mut buf)?;
        }
        Ok(buf.into())
    }

    /// Parse a `DataPacket` response payload that is neither sealed nor
    /// compressed.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or truncated input, or flags that require
    /// decryption or decompression.
    pub fn decode(payload: &[u8], format: &MeasurementFormat<'_>) -> Result<Self> {
        let (&first, mut rest) = payload.split_first().ok_or(ProtocolError::PayloadTooShort {
            context: "data packet",
            expected: 1,
            actual: 0,
        })?;
        let flags = DataPacketFlags::from_byte(first);
        if flags.intersects(DataPacketFlags::CIPHER_INDEX | DataPacketFlags::COMPRESSED) {
            return Err(ProtocolError::InvalidFlags(first));
        }

        let prelude = PacketPrelude::decode(flags, &mut rest)?;
        let default_time = prelude.frame_timestamp.unwrap_or_default();
        let measurements = format.decode_all(rest, prelude.count, default_time)?;

        Ok(Self { flags, frame_timestamp: prelude.frame_timestamp, measurements })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::SignalIndexCache;

    #[test]
    fn full_packet_layout() {
        let packet = PlainDataPacket {
            flags: DataPacketFlags::empty(),
            frame_timestamp: None,
            measurements: vec![Measurement::new(Uuid::from_u128(1), 1.0, Ticks(2))],
        };
        let bytes = packet.encode(&MeasurementFormat::Full).unwrap();

        assert_eq!(bytes.len(), 1 + 4 + 36);
        assert_eq!(&bytes[..5], &[0, 0, 0, 0, 1]);
        assert_eq!(PlainDataPacket::decode(&bytes, &MeasurementFormat::Full).unwrap(), packet);
    }

    #[test]
    fn synchronized_compact_packet_shares_frame_time() {
        let cache = SignalIndexCache::new(Uuid::nil(), vec![Uuid::from_u128(1), Uuid::from_u128(2)], vec![])
            .unwrap();
        let format = MeasurementFormat::Compact(CompactContext {
            cache: &cache,
            base_times: None,
            include_time: false,
            millisecond_resolution: false,
        });
        let packet = PlainDataPacket {
            flags: DataPacketFlags::SYNCHRONIZED | DataPacketFlags::COMPACT,
            frame_timestamp: Some(Ticks(900)),
            measurements: vec![
                Measurement::new(Uuid::from_u128(2), 0.5, Ticks(900)),
                Measurement::new(Uuid::from_u128(1), -8.0, Ticks(900)),
            ],
        };

        let bytes = packet.encode(&format).unwrap();
        assert_eq!(bytes.len(), 1 + 8 + 4 + 2 * 7);
        assert_eq!(PlainDataPacket::decode(&bytes, &format).unwrap(), packet);
    }

    #[test]
    fn sealed_flags_are_not_plain() {
        assert_eq!(
            PlainDataPacket::decode(&[0x04, 0, 0, 0, 0], &MeasurementFormat::Full),
            Err(ProtocolError::InvalidFlags(0x04))
        );
    }

    #[test]
    fn declared_count_must_be_present() {
        assert_eq!(
            PlainDataPacket::decode(&[0x00, 0, 0, 0, 3], &MeasurementFormat::Full),
            Err(ProtocolError::CountMismatch { declared: 3, parsed: 0 })
        );
    }

    #[test]
    fn batches_split_at_packet_limit() {
        let measurements: Vec<_> =
            (0..2_000).map(|i| Measurement::new(Uuid::from_u128(i), 0.0, Ticks(0))).collect();
        let runs = split_batches(&measurements, &MeasurementFormat::Full);

        let per_run = MAX_PACKET_SIZE / Measurement::FULL_SIZE;
        assert_eq!(runs[0].len(), per_run);
        assert_eq!(runs.iter().map(|r| r.len()).sum::<usize>(), 2_000);
        assert!(runs.iter().all(|r| r.len() * Measurement::FULL_SIZE <= MAX_PACKET_SIZE));
        assert!(split_batches(&[], &MeasurementFormat::Full).is_empty());
    }
}
