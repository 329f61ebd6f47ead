//! Random input fuzzer for plain data packet decoding
//!
//! Arbitrary bytes are decoded as a full-format packet and as a compact
//! packet against a small signal index cache, with and without base times.
//! Decoding may fail, but must never panic or read past the input.

#![no_main]

use gep_proto::{
    BaseTimeOffsets, CompactContext, DataPacketFlags, Measurement, MeasurementFormat, PlainDataPacket,
    SignalIndexCache, Ticks,
};
use libfuzzer_sys::fuzz_target;
use uuid::Uuid;

fuzz_target!(|data: &[u8]| {
    // INVARIANT 1: Full packets never claim more measurements than bytes
    if let Ok(packet) = PlainDataPacket::decode(data, &MeasurementFormat::Full) {
        let prelude = if packet.flags.contains(DataPacketFlags::SYNCHRONIZED) { 13 } else { 5 };
        assert!(prelude + packet.measurements.len() * Measurement::FULL_SIZE <= data.len());
    }

    let signals: Vec<_> = (1..=8u128).map(Uuid::from_u128).collect();
    let Ok(cache) = SignalIndexCache::new(Uuid::nil(), signals, Vec::new()) else {
        return;
    };
    let base = BaseTimeOffsets { time_index: 0, base: [Ticks(1_000_000), Ticks(2_000_000)] };

    for base_times in [None, Some(&base)] {
        for include_time in [false, true] {
            for millisecond_resolution in [false, true] {
                let format = MeasurementFormat::Compact(CompactContext {
                    cache: &cache,
                    base_times,
                    include_time,
                    millisecond_resolution,
                });

                // INVARIANT 2: Every decoded compact measurement maps to a
                // cached signal
                if let Ok(packet) = PlainDataPacket::decode(data, &format) {
                    assert!(packet.measurements.iter().all(|m| cache.contains(&m.signal_id)));
                }
            }
        }
    }
});
