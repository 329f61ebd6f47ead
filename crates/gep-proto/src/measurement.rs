//! Measurements and the full (36-byte) serialization format.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    MeasurementFlags,
    errors::{ProtocolError, Result},
};

/// Stable 128-bit identifier of a signal
pub type SignalId = Uuid;

/// Timestamp in 100-nanosecond ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticks(pub i64);

impl Ticks {
    /// Ticks per millisecond
    pub const PER_MILLISECOND: i64 = 10_000;

    /// Ticks per second
    pub const PER_SECOND: i64 = 10_000_000;

    /// Raw tick count
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Add a whole number of milliseconds.
    #[must_use]
    pub const fn add_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis.saturating_mul(Self::PER_MILLISECOND)))
    }

    /// Ticks for a `Duration`, saturating at `i64::MAX`.
    #[must_use]
    pub fn from_duration(duration: std::time::Duration) -> Self {
        Self(i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX))
    }
}

/// One sample of one signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Signal identifier
    pub signal_id: SignalId,
    /// Sample value
    pub value: f64,
    /// Sample time
    pub timestamp: Ticks,
    /// Quality and state flags
    pub flags: MeasurementFlags,
}

impl Measurement {
    /// Size of the full serialization
    pub const FULL_SIZE: usize = 16 + 8 + 8 + 4;

    /// Create a measurement with no state flags.
    #[must_use]
    pub fn new(signal_id: SignalId, value: f64, timestamp: Ticks) -> Self {
        Self { signal_id, value, timestamp, flags: MeasurementFlags::empty() }
    }

    /// Write the full format:
    /// `[signal_id:16][value: f64 BE][timestamp: i64 BE][flags: u32 BE]`.
    pub fn encode_full(&self, dst: &mut impl BufMut) {
        dst.put_slice(self.signal_id.as_bytes());
        dst.put_f64(self.value);
        dst.put_i64(self.timestamp.0);
        dst.put_u32(self.flags.bits());
    }

    /// Read one full-format measurement, advancing `src`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooShort`] if fewer than 36 bytes remain.
    pub fn decode_full(src: &mut &[u8]) -> Result<Self> {
        if src.len() < Self::FULL_SIZE {
            return Err(ProtocolError::PayloadTooShort {
                context: "measurement",
                expected: Self::FULL_SIZE,
                actual: src.len(),
            });
        }

        let mut id = [0u8; 16];
        src.copy_to_slice(&mut id);
        let value = src.get_f64();
        let timestamp = Ticks(src.get_i64());
        let flags = MeasurementFlags::from_bits_retain(src.get_u32());

        Ok(Self { signal_id: Uuid::from_bytes(id), value, timestamp, flags })
    }
}

/// Write `[count: u32 BE]` followed by full-format measurements.
pub fn encode_full_batch(measurements: &[Measurement], dst: &mut impl BufMut) {
    #[allow(clippy::cast_possible_truncation)]
    dst.put_u32(measurements.len() as u32);
    for measurement in measurements {
        measurement.encode_full(dst);
    }
}

/// Read `[count: u32 BE]` followed by full-format measurements.
///
/// # Errors
///
/// Returns an error if the buffer holds fewer measurements than declared.
pub fn decode_full_batch(mut src: &[u8]) -> Result<Vec<Measurement>> {
    if src.len() < 4 {
        return Err(ProtocolError::PayloadTooShort {
            context: "measurement batch",
            expected: 4,
            actual: src.len(),
        });
    }
    let declared = src.get_u32() as usize;
    if src.len() / Measurement::FULL_SIZE < declared {
        return Err(ProtocolError::CountMismatch {
            declared,
            parsed: src.len() / Measurement::FULL_SIZE,
        });
    }

    (0..declared).map(|_| Measurement::decode_full(&mut src)).collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    pub(crate) fn arbitrary_measurement() -> impl Strategy<Value = Measurement> {
        (any::<u128>(), -1.0e9f64..1.0e9, any::<i64>(), any::<u32>()).prop_map(
            |(id, value, ticks, flags)| Measurement {
                signal_id: Uuid::from_u128(id),
                value,
                timestamp: Ticks(ticks),
                flags: MeasurementFlags::from_bits_retain(flags),
            },
        )
    }

    #[test]
    fn full_layout() {
        let measurement = Measurement {
            signal_id: Uuid::from_u128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10),
            value: 1.0,
            timestamp: Ticks(2),
            flags: MeasurementFlags::BAD_DATA,
        };
        let mut buf = Vec::new();
        measurement.encode_full(&mut buf);

        assert_eq!(buf.len(), Measurement::FULL_SIZE);
        assert_eq!(&buf[..16], &(1u8..=16).collect::<Vec<_>>()[..]);
        assert_eq!(&buf[16..24], &1.0f64.to_be_bytes());
        assert_eq!(&buf[24..32], &2i64.to_be_bytes());
        assert_eq!(&buf[32..36], &[0, 0, 0, 1]);
    }

    #[test]
    fn truncated_batch_is_rejected() {
        let mut buf = Vec::new();
        encode_full_batch(&[Measurement::new(Uuid::nil(), 0.0, Ticks(0))], &mut buf);
        buf.truncate(buf.len() - 1);

        assert_eq!(decode_full_batch(&buf), Err(ProtocolError::CountMismatch {
            declared: 1,
            parsed: 0
        }));
    }

    #[test]
    fn ticks_from_duration() {
        assert_eq!(Ticks::from_duration(std::time::Duration::from_millis(3)), Ticks(30_000));
        assert_eq!(Ticks(5).add_millis(1), Ticks(10_005));
    }

    proptest! {
        #[test]
        fn full_batch_preserves_measurements(batch in prop::collection::vec(arbitrary_measurement(), 0..20)) {
            let mut buf = Vec::new();
            encode_full_batch(&batch, &mut buf);
            prop_assert_eq!(decode_full_batch(&buf).unwrap(), batch);
        }
    }
}
