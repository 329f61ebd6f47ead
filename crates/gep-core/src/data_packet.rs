//! Sealed and compressed data packets.
//!
//! Extends the plain layout from [`gep_proto::data_packet`] with the two
//! session-owned transforms:
//!
//! ```text
//! [flags:1] | seal?( [frame_timestamp?][count: u32 BE] compress?( body ) )
//! ```
//!
//! Compression replaces `body` with `[codec_sequence: u16 BE][codec output]`.
//! Sealing replaces everything right of the flags byte with
//! `[counter: u64 BE][ciphertext || tag]` under the active key generation,
//! whose index goes into `CIPHER_INDEX`.
//!
//! A receiver treats a packet as sealed exactly when it holds cipher keys.

use bytes::{BufMut, Bytes};
use gep_proto::{
    CompactContext, DataPacketFlags, Measurement, MeasurementFormat, PacketPrelude, ProtocolError, Ticks,
    data_packet::split_batches,
};

use crate::{
    cipher::CipherKeys,
    compression::{CompressionDecoder, CompressionEncoder, StatefulCodec},
    error::SessionError,
};

/// Builds wire payloads for one subscription
#[derive(Debug, Default)]
pub struct DataPacketEncoder {
    counter: u64,
    compressor: Option<CompressionEncoder>,
}

impl DataPacketEncoder {
    /// Encoder, compressing bodies when `compressor` is set
    #[must_use]
    pub fn new(compressor: Option<CompressionEncoder>) -> Self {
        Self { counter: 0, compressor }
    }

    /// Whether bodies are compressed
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.compressor.is_some()
    }

    /// Announce a codec reset with the next packet.
    pub fn reset_compression(&mut self) {
        if let Some(compressor) = &mut self.compressor {
            compressor.reset();
        }
    }

    /// Encode `measurements` into as many packets as the size limit needs.
    ///
    /// `frame_timestamp` marks a synchronized frame. Packets are sealed when
    /// `keys` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if a measurement cannot be encoded in `format`, or
    /// if compression or sealing fails.
    pub fn encode(
        &mut self,
        measurements: &[Measurement],
        frame_timestamp: Option<Ticks>,
        format: &MeasurementFormat<'_>,
        keys: Option<&CipherKeys>,
    ) -> Result<Vec<Bytes>, SessionError> {
        let mut flags = DataPacketFlags::empty();
        if frame_timestamp.is_some() {
            flags |= DataPacketFlags::SYNCHRONIZED;
        }
        if matches!(format, MeasurementFormat::Compact(_)) {
            flags |= DataPacketFlags::COMPACT;
        }
        if self.compressor.is_some() {
            flags |= DataPacketFlags::COMPRESSED;
        }
        if keys.is_some_and(|k| k.active_index() == 1) {
            flags |= DataPacketFlags::CIPHER_INDEX;
        }

        let batches = split_batches(measurements, format);
        let mut packets = Vec::with_capacity(batches.len());

        for batch in batches {
            let mut body = Vec::with_capacity(batch.iter().map(|m| format.encoded_len(m)).sum());
            for measurement in batch {
                format.encode(measurement, &mut body)?;
            }

            let mut plain = Vec::with_capacity(12 + body.len());
            #[allow(clippy::cast_possible_truncation)]
            PacketPrelude { frame_timestamp, count: batch.len() as u32 }.encode(&mut plain);
            match &mut self.compressor {
                Some(compressor) => plain.extend_from_slice(&compressor.encode(&body)?),
                None => plain.extend_from_slice(&body),
            }

            let mut packet = Vec::with_capacity(1 + plain.len() + 24);
            packet.put_u8(flags.to_byte());
            match keys {
                Some(keys) => {
                    packet.extend_from_slice(&keys.seal(self.counter, &plain)?);
                    self.counter = self.counter.wrapping_add(1);
                },
                None => packet.extend_from_slice(&plain),
            }
            packets.push(packet.into());
        }

        Ok(packets)
    }
}

/// A data packet after opening and decompression
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// Flags byte as received
    pub flags: DataPacketFlags,
    /// Frame timestamp of a synchronized packet
    pub frame_timestamp: Option<Ticks>,
    /// Measurements in wire order
    pub measurements: Vec<Measurement>,
}

/// Reads data packets for one subscription
#[derive(Debug)]
pub struct DataPacketDecoder {
    decompressor: CompressionDecoder,
}

impl DataPacketDecoder {
    /// Decoder using `codec` for compressed bodies
    #[must_use]
    pub fn new(codec: Box<dyn StatefulCodec>) -> Self {
        Self { decompressor: CompressionDecoder::new(codec) }
    }

    /// Forget the codec stream (new subscription).
    pub fn reset(&mut self) {
        self.decompressor.reset();
    }

    /// Decode one `DataPacket` payload.
    ///
    /// `compact` describes the subscription's compact layout; it is required
    /// for packets flagged `COMPACT`. Synchronized packets never carry
    /// per-measurement time.
    ///
    /// # Errors
    ///
    /// Returns cipher, compression (including desync) or protocol errors.
    pub fn decode(
        &mut self,
        payload: &[u8],
        keys: Option<&CipherKeys>,
        compact: Option<CompactContext<'_>>,
    ) -> Result<DecodedPacket, SessionError> {
        let (&first, rest) = payload.split_first().ok_or(ProtocolError::PayloadTooShort {
            context: "data packet",
            expected: 1,
            actual: 0,
        })?;
        let flags = DataPacketFlags::from_byte(first);

        let opened;
        let mut plain: &[u8] = match keys {
            Some(keys) => {
                opened = keys.open(flags.cipher_index(), rest)?;
                &opened
            },
            None => rest,
        };

        let prelude = PacketPrelude::decode(flags, &mut plain)?;

        let decompressed;
        let body: &[u8] = if flags.contains(DataPacketFlags::COMPRESSED) {
            decompressed = self.decompressor.decode(plain)?;
            &decompressed
        } else {
            plain
        };

        let format = if flags.contains(DataPacketFlags::COMPACT) {
            let context = compact.ok_or(ProtocolError::InvalidFlags(first))?;
            MeasurementFormat::Compact(CompactContext {
                include_time: context.include_time && prelude.frame_timestamp.is_none(),
                ..context
            })
        } else {
            MeasurementFormat::Full
        };

        let default_time = prelude.frame_timestamp.unwrap_or_default();
        let measurements = format.decode_all(body, prelude.count, default_time)?;

        Ok(DecodedPacket { flags, frame_timestamp: prelude.frame_timestamp, measurements })
    }
}

#[cfg(test)]
mod tests {
    use gep_proto::{MAX_PACKET_SIZE, SignalIndexCache};
    use uuid::Uuid;

    use super::*;
    use crate::{
        cipher::KeyIvPair,
        compression::DeflateStreamCodec,
        error::{CipherError, CompressionError},
    };

    fn measurements(count: u128) -> Vec<Measurement> {
        (1..=count).map(|n| Measurement::new(Uuid::from_u128(n), n as f64, Ticks(1_000 + n as i64))).collect()
    }

    fn keys(active: usize) -> CipherKeys {
        CipherKeys::new(active, KeyIvPair::from_parts([1; 32], [2; 12]), KeyIvPair::from_parts([3; 32], [4; 12]))
            .unwrap()
    }

    #[test]
    fn flags_reflect_transforms() {
        let cache = SignalIndexCache::new(Uuid::nil(), (1..=3).map(Uuid::from_u128).collect(), vec![]).unwrap();
        let compact = CompactContext { cache: &cache, base_times: None, include_time: false, millisecond_resolution: false };
        let mut encoder =
            DataPacketEncoder::new(Some(CompressionEncoder::new(Box::new(DeflateStreamCodec::new()))));

        let packets = encoder
            .encode(&measurements(3), Some(Ticks(5)), &MeasurementFormat::Compact(compact), Some(&keys(1)))
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            DataPacketFlags::from_byte(packets[0][0]),
            DataPacketFlags::SYNCHRONIZED
                | DataPacketFlags::COMPACT
                | DataPacketFlags::COMPRESSED
                | DataPacketFlags::CIPHER_INDEX
        );
    }

    #[test]
    fn plain_packet_matches_proto_layout() {
        let batch = measurements(2);
        let mut encoder = DataPacketEncoder::default();
        let packets = encoder.encode(&batch, None, &MeasurementFormat::Full, None).unwrap();

        let plain = gep_proto::PlainDataPacket::decode(&packets[0], &MeasurementFormat::Full).unwrap();
        assert_eq!(plain.measurements, batch);
    }

    #[test]
    fn large_batches_split() {
        let batch = measurements(2_000);
        let mut encoder = DataPacketEncoder::default();
        let packets = encoder.encode(&batch, None, &MeasurementFormat::Full, None).unwrap();

        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.len() <= 1 + 4 + MAX_PACKET_SIZE));

        let mut decoder = DataPacketDecoder::new(Box::new(DeflateStreamCodec::new()));
        let decoded: Vec<_> =
            packets.iter().flat_map(|p| decoder.decode(p, None, None).unwrap().measurements).collect();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn empty_batch_sends_nothing() {
        let mut encoder = DataPacketEncoder::default();
        assert!(encoder.encode(&[], None, &MeasurementFormat::Full, None).unwrap().is_empty());
    }

    #[test]
    fn counter_advances_per_sealed_packet() {
        let keys = keys(0);
        let mut encoder = DataPacketEncoder::default();
        let a = encoder.encode(&measurements(1), None, &MeasurementFormat::Full, Some(&keys)).unwrap();
        let b = encoder.encode(&measurements(1), None, &MeasurementFormat::Full, Some(&keys)).unwrap();
        assert_eq!(&a[0][1..9], &0u64.to_be_bytes());
        assert_eq!(&b[0][1..9], &1u64.to_be_bytes());
    }

    #[test]
    fn wrong_keys_fail_to_open() {
        let mut encoder = DataPacketEncoder::default();
        let packets = encoder.encode(&measurements(1), None, &MeasurementFormat::Full, Some(&keys(0))).unwrap();

        let other = CipherKeys::new(0, KeyIvPair::from_parts([7; 32], [7; 12]), KeyIvPair::from_parts([7; 32], [7; 12]))
            .unwrap();
        let mut decoder = DataPacketDecoder::new(Box::new(DeflateStreamCodec::new()));
        assert_eq!(
            decoder.decode(&packets[0], Some(&other), None),
            Err(SessionError::Cipher(CipherError::Open))
        );
    }

    #[test]
    fn compact_packet_without_context_is_rejected() {
        let cache = SignalIndexCache::new(Uuid::nil(), vec![Uuid::from_u128(1)], vec![]).unwrap();
        let compact = CompactContext { cache: &cache, base_times: None, include_time: true, millisecond_resolution: false };
        let mut encoder = DataPacketEncoder::default();
        let packets = encoder.encode(&measurements(1), None, &MeasurementFormat::Compact(compact), None).unwrap();

        let mut decoder = DataPacketDecoder::new(Box::new(DeflateStreamCodec::new()));
        assert!(matches!(
            decoder.decode(&packets[0], None, None),
            Err(SessionError::Protocol(ProtocolError::InvalidFlags(_)))
        ));
    }

    #[test]
    fn lost_compressed_packet_desyncs() {
        let mut encoder =
            DataPacketEncoder::new(Some(CompressionEncoder::new(Box::new(DeflateStreamCodec::new()))));
        let mut decoder = DataPacketDecoder::new(Box::new(DeflateStreamCodec::new()));

        let first = encoder.encode(&measurements(1), None, &MeasurementFormat::Full, None).unwrap();
        let _lost = encoder.encode(&measurements(1), None, &MeasurementFormat::Full, None).unwrap();
        let third = encoder.encode(&measurements(1), None, &MeasurementFormat::Full, None).unwrap();

        assert!(decoder.decode(&first[0], None, None).is_ok());
        assert_eq!(
            decoder.decode(&third[0], None, None),
            Err(SessionError::Compression(CompressionError::Desync { expected: Some(1), actual: 2 }))
        );

        encoder.reset_compression();
        let fresh = encoder.encode(&measurements(1), None, &MeasurementFormat::Full, None).unwrap();
        assert_eq!(decoder.decode(&fresh[0], None, None).unwrap().measurements, measurements(1));
    }

    #[test]
    fn empty_payload() {
        let mut decoder = DataPacketDecoder::new(Box::new(DeflateStreamCodec::new()));
        assert!(decoder.decode(&[], None, None).is_err());
    }
}
