//! Compact measurement format.
//!
//! ```text
//! [compact_flags:1][runtime_index: u16 BE][value: f32 BE][time]
//! ```
//!
//! `time` is absent when the subscription excludes time (and for
//! synchronized packets, which carry one frame timestamp instead). Otherwise
//! it is 2 bytes of millisecond offset, 4 bytes of tick offset, or 8 bytes of
//! full ticks, chosen per measurement by [`BaseTimeOffsets`].

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{
    CompactStateFlags, Measurement, SignalIndexCache, Ticks,
    errors::{ProtocolError, Result},
};

/// The two base times a compact subscription offsets timestamps against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseTimeOffsets {
    /// Slot currently used for new offsets (0 or 1)
    pub time_index: usize,
    /// Base times for slot 0 and slot 1
    pub base: [Ticks; 2],
}

impl BaseTimeOffsets {
    /// Wire size of an `UpdateBaseTimes` payload
    pub const SIZE: usize = 4 + 8 + 8;

    /// Serialize as `[time_index: i32 BE][base0: i64 BE][base1: i64 BE]`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        dst.put_i32(self.time_index as i32);
        dst.put_i64(self.base[0].0);
        dst.put_i64(self.base[1].0);
    }

    /// Parse an `UpdateBaseTimes` payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is short or the index is not 0 or 1.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(ProtocolError::PayloadTooShort {
                context: "base times",
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        let time_index = src.get_i32();
        let time_index = match time_index {
            0 | 1 => time_index as usize,
            other => {
                return Err(ProtocolError::LengthOutOfRange {
                    context: "base time index",
                    length: other.unsigned_abs() as usize,
                    min: 0,
                    max: 1,
                });
            },
        };
        let base = [Ticks(src.get_i64()), Ticks(src.get_i64())];
        Ok(Self { time_index, base })
    }

    fn offset(&self, timestamp: Ticks, millisecond_resolution: bool) -> Option<TimeOffset> {
        let base = self.base[self.time_index].0;
        let diff = timestamp.0.checked_sub(base)?;
        if base <= 0 || diff <= 0 {
            return None;
        }

        if millisecond_resolution {
            let millis = diff / Ticks::PER_MILLISECOND;
            u16::try_from(millis).ok().filter(|m| *m < u16::MAX).map(TimeOffset::Millis)
        } else {
            u32::try_from(diff).ok().filter(|t| *t < u32::MAX).map(TimeOffset::Ticks)
        }
    }
}

enum TimeOffset {
    Millis(u16),
    Ticks(u32),
}

/// Per-subscription state the compact codec needs
#[derive(Debug, Clone, Copy)]
pub struct CompactContext<'a> {
    /// Active signal index cache
    pub cache: &'a SignalIndexCache,
    /// Active base times, if the subscription has them
    pub base_times: Option<&'a BaseTimeOffsets>,
    /// Whether each measurement carries its own time
    pub include_time: bool,
    /// Offsets are whole milliseconds instead of ticks
    pub millisecond_resolution: bool,
}

impl CompactContext<'_> {
    /// Encoded size of `measurement`
    #[must_use]
    pub fn encoded_len(&self, measurement: &Measurement) -> usize {
        7 + self.time_len(measurement.timestamp)
    }

    fn time_len(&self, timestamp: Ticks) -> usize {
        if !self.include_time {
            return 0;
        }
        match self.base_times.and_then(|b| b.offset(timestamp, self.millisecond_resolution)) {
            Some(TimeOffset::Millis(_)) => 2,
            Some(TimeOffset::Ticks(_)) => 4,
            None => 8,
        }
    }

    /// Write one compact measurement.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnmappedSignal`] if the signal has no runtime
    /// index in the cache.
    pub fn encode(&self, measurement: &Measurement, dst: &mut impl BufMut) -> Result<()> {
        let index = self
            .cache
            .index_of(&measurement.signal_id)
            .ok_or(ProtocolError::UnmappedSignal(measurement.signal_id))?;

        let mut flags = CompactStateFlags::from_measurement_flags(measurement.flags);
        let offset = if self.include_time {
            self.base_times.and_then(|b| b.offset(measurement.timestamp, self.millisecond_resolution))
        } else {
            None
        };
        if offset.is_some() {
            flags |= CompactStateFlags::BASE_TIME_OFFSET;
            if self.base_times.is_some_and(|b| b.time_index == 1) {
                flags |= CompactStateFlags::TIME_INDEX;
            }
        }

        dst.put_u8(flags.to_byte());
        dst.put_u16(index);
        #[allow(clippy::cast_possible_truncation)]
        dst.put_f32(measurement.value as f32);

        match offset {
            Some(TimeOffset::Millis(millis)) => dst.put_u16(millis),
            Some(TimeOffset::Ticks(ticks)) => dst.put_u32(ticks),
            None if self.include_time => dst.put_i64(measurement.timestamp.0),
            None => {},
        }
        Ok(())
    }

    /// Read one compact measurement, advancing `src`.
    ///
    /// `default_time` fills the timestamp when the measurement carries none.
    ///
    /// # Errors
    ///
    /// Returns an error for truncated input, an unknown runtime index, or a
    /// base-time offset without base times.
    pub fn decode(&self, src: &mut &[u8], default_time: Ticks) -> Result<Measurement> {
        ensure(src, 7)?;
        let flags = CompactStateFlags::from_byte(src.get_u8());
        let index = src.get_u16();
        let value = f64::from(src.get_f32());

        let signal_id = self.cache.signal_id(index).ok_or(ProtocolError::UnknownRuntimeIndex(index))?;

        let timestamp = if !self.include_time {
            default_time
        } else if flags.contains(CompactStateFlags::BASE_TIME_OFFSET) {
            let base_times = self.base_times.ok_or(ProtocolError::InvalidFlags(flags.to_byte()))?;
            let base = base_times.base[usize::from(flags.contains(CompactStateFlags::TIME_INDEX))];
            if self.millisecond_resolution {
                ensure(src, 2)?;
                base.add_millis(i64::from(src.get_u16()))
            } else {
                ensure(src, 4)?;
                Ticks(base.0.saturating_add(i64::from(src.get_u32())))
            }
        } else {
            ensure(src, 8)?;
            Ticks(src.get_i64())
        };

        Ok(Measurement { signal_id, value, timestamp, flags: flags.to_measurement_flags() })
    }
}

fn ensure(src: &[u8], needed: usize) -> Result<()> {
    if src.len() < needed {
        return Err(ProtocolError::PayloadTooShort {
            context: "compact measurement",
            expected: needed,
            actual: src.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::MeasurementFlags;

    fn cache() -> SignalIndexCache {
        SignalIndexCache::new(Uuid::nil(), vec![Uuid::from_u128(10), Uuid::from_u128(20)], vec![])
            .unwrap()
    }

    fn context<'a>(
        cache: &'a SignalIndexCache,
        base_times: Option<&'a BaseTimeOffsets>,
        millis: bool,
    ) -> CompactContext<'a> {
        CompactContext { cache, base_times, include_time: true, millisecond_resolution: millis }
    }

    #[test]
    fn tick_offset_uses_four_bytes() {
        let cache = cache();
        let base = BaseTimeOffsets { time_index: 1, base: [Ticks(1), Ticks(1_000)] };
        let ctx = context(&cache, Some(&base), false);
        let measurement = Measurement::new(Uuid::from_u128(20), 2.5, Ticks(1_500));

        let mut buf = Vec::new();
        ctx.encode(&measurement, &mut buf).unwrap();

        assert_eq!(buf.len(), 11);
        assert_eq!(buf[0], 0xC0);
        assert_eq!(&buf[1..3], &[0, 1]);
        assert_eq!(&buf[7..11], &500u32.to_be_bytes());

        let decoded = ctx.decode(&mut buf.as_slice(), Ticks(0)).unwrap();
        assert_eq!(decoded, measurement);
    }

    #[test]
    fn millisecond_offset_truncates_sub_millisecond_ticks() {
        let cache = cache();
        let base = BaseTimeOffsets { time_index: 0, base: [Ticks(10_000), Ticks(0)] };
        let ctx = context(&cache, Some(&base), true);
        let measurement = Measurement::new(Uuid::from_u128(10), 1.0, Ticks(10_000 + 30_007));

        let mut buf = Vec::new();
        ctx.encode(&measurement, &mut buf).unwrap();
        assert_eq!(buf.len(), 9);

        let decoded = ctx.decode(&mut buf.as_slice(), Ticks(0)).unwrap();
        assert_eq!(decoded.timestamp, Ticks(40_000));
    }

    #[test]
    fn full_time_when_offset_does_not_apply() {
        let cache = cache();
        let base = BaseTimeOffsets { time_index: 0, base: [Ticks(5_000), Ticks(0)] };
        let ctx = context(&cache, Some(&base), false);

        // Before the base time.
        assert_eq!(ctx.encoded_len(&Measurement::new(Uuid::from_u128(10), 0.0, Ticks(4_000))), 15);
        // Too far past the base time for a u32 offset.
        assert_eq!(
            ctx.encoded_len(&Measurement::new(Uuid::from_u128(10), 0.0, Ticks(5_000 + i64::from(u32::MAX)))),
            15
        );
        assert_eq!(ctx.encoded_len(&Measurement::new(Uuid::from_u128(10), 0.0, Ticks(6_000))), 11);
    }

    #[test]
    fn without_time_uses_default() {
        let cache = cache();
        let ctx = CompactContext {
            cache: &cache,
            base_times: None,
            include_time: false,
            millisecond_resolution: false,
        };
        let mut measurement = Measurement::new(Uuid::from_u128(10), -4.0, Ticks(123));
        measurement.flags = MeasurementFlags::DATA_QUALITY_MASK;

        let mut buf = Vec::new();
        ctx.encode(&measurement, &mut buf).unwrap();
        assert_eq!(buf.len(), 7);

        let decoded = ctx.decode(&mut buf.as_slice(), Ticks(77)).unwrap();
        assert_eq!(decoded.timestamp, Ticks(77));
        assert_eq!(decoded.flags, MeasurementFlags::DATA_QUALITY_MASK);
    }

    #[test]
    fn unmapped_and_unknown_index() {
        let cache = cache();
        let ctx = context(&cache, None, false);

        let stranger = Measurement::new(Uuid::from_u128(30), 0.0, Ticks(1));
        assert_eq!(
            ctx.encode(&stranger, &mut Vec::new()),
            Err(ProtocolError::UnmappedSignal(Uuid::from_u128(30)))
        );

        let wire = [0u8, 0, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(ctx.decode(&mut &wire[..], Ticks(0)), Err(ProtocolError::UnknownRuntimeIndex(9)));
    }

    #[test]
    fn base_times_payload() {
        let base = BaseTimeOffsets { time_index: 1, base: [Ticks(3), Ticks(4)] };
        let mut buf = Vec::new();
        base.encode(&mut buf);

        assert_eq!(buf, [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 4]);
        assert_eq!(BaseTimeOffsets::decode(&buf).unwrap(), base);

        buf[3] = 2;
        assert!(BaseTimeOffsets::decode(&buf).is_err());
    }
}
