//! Flag sets carried on the wire.
//!
//! - [`DataPacketFlags`]: first byte of every `DataPacket` payload
//! - [`MeasurementFlags`]: 32-bit quality/state flags of a measurement
//! - [`CompactStateFlags`]: the 8-bit compact-format projection of both

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Data packet flags (8 bits)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DataPacketFlags: u8 {
        /// Packet carries one timestamp-aligned frame
        const SYNCHRONIZED = 0b0000_0001;

        /// Measurements use the compact format
        const COMPACT = 0b0000_0010;

        /// Payload after the flags byte is sealed with the odd key set
        const CIPHER_INDEX = 0b0000_0100;

        /// Measurement body is stateful-codec compressed
        const COMPRESSED = 0b0000_1000;

        /// Codec output is little-endian
        const LITTLE_ENDIAN_COMPRESSION = 0b0001_0000;
    }
}

impl DataPacketFlags {
    /// Create flags from raw byte value
    ///
    /// This function is **infallible**. All 256 byte values are valid;
    /// unknown bits are preserved but never checked.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    /// Convert to raw byte value
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.bits()
    }

    /// Cipher key set selected by [`DataPacketFlags::CIPHER_INDEX`]
    #[must_use]
    pub const fn cipher_index(self) -> usize {
        if self.contains(Self::CIPHER_INDEX) { 1 } else { 0 }
    }
}

impl Default for DataPacketFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Measurement state flags (32 bits)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MeasurementFlags: u32 {
        /// Value is bad
        const BAD_DATA = 1 << 0;
        /// Value is suspect
        const SUSPECT_DATA = 1 << 1;
        /// Value above its valid range
        const OVER_RANGE_ERROR = 1 << 2;
        /// Value below its valid range
        const UNDER_RANGE_ERROR = 1 << 3;
        /// High alarm
        const ALARM_HIGH = 1 << 4;
        /// Low alarm
        const ALARM_LOW = 1 << 5;
        /// High warning
        const WARNING_HIGH = 1 << 6;
        /// Low warning
        const WARNING_LOW = 1 << 7;
        /// Value has not changed for too long
        const FLATLINE_ALARM = 1 << 8;
        /// Value disagrees with a comparison signal
        const COMPARISON_ALARM = 1 << 9;
        /// Rate of change alarm
        const ROC_ALARM = 1 << 10;
        /// Source reported the value as bad
        const RECEIVED_AS_BAD = 1 << 11;
        /// Value was calculated
        const CALCULATED_VALUE = 1 << 12;
        /// Calculation failed
        const CALCULATION_ERROR = 1 << 13;
        /// Calculation produced a warning
        const CALCULATION_WARNING = 1 << 14;
        /// Reserved quality bit
        const RESERVED_QUALITY_FLAG = 1 << 15;
        /// Timestamp is bad
        const BAD_TIME = 1 << 16;
        /// Timestamp is suspect
        const SUSPECT_TIME = 1 << 17;
        /// Arrived later than allowed
        const LATE_TIME_ALARM = 1 << 18;
        /// Timestamp is in the future
        const FUTURE_TIME_ALARM = 1 << 19;
        /// Value was up-sampled
        const UP_SAMPLED = 1 << 20;
        /// Value was down-sampled
        const DOWN_SAMPLED = 1 << 21;
        /// Value was discarded by alignment
        const DISCARDED_VALUE = 1 << 22;
        /// Reserved time bit
        const RESERVED_TIME_FLAG = 1 << 23;
        /// System error
        const SYSTEM_ERROR = 1 << 29;
        /// System warning
        const SYSTEM_WARNING = 1 << 30;
        /// Measurement error
        const MEASUREMENT_ERROR = 1 << 31;

        /// Any data range condition
        const DATA_RANGE_MASK = Self::OVER_RANGE_ERROR.bits()
            | Self::UNDER_RANGE_ERROR.bits()
            | Self::ALARM_HIGH.bits()
            | Self::ALARM_LOW.bits()
            | Self::WARNING_HIGH.bits()
            | Self::WARNING_LOW.bits();

        /// Any data quality condition
        const DATA_QUALITY_MASK = Self::BAD_DATA.bits()
            | Self::SUSPECT_DATA.bits()
            | Self::FLATLINE_ALARM.bits()
            | Self::COMPARISON_ALARM.bits()
            | Self::ROC_ALARM.bits()
            | Self::RECEIVED_AS_BAD.bits()
            | Self::CALCULATION_ERROR.bits()
            | Self::CALCULATION_WARNING.bits()
            | Self::RESERVED_QUALITY_FLAG.bits();

        /// Any time quality condition
        const TIME_QUALITY_MASK = Self::BAD_TIME.bits()
            | Self::SUSPECT_TIME.bits()
            | Self::LATE_TIME_ALARM.bits()
            | Self::FUTURE_TIME_ALARM.bits()
            | Self::UP_SAMPLED.bits()
            | Self::DOWN_SAMPLED.bits()
            | Self::RESERVED_TIME_FLAG.bits();

        /// Any system condition
        const SYSTEM_ISSUE_MASK = Self::SYSTEM_ERROR.bits()
            | Self::SYSTEM_WARNING.bits()
            | Self::MEASUREMENT_ERROR.bits();
    }
}

impl Default for MeasurementFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Compact measurement state flags (8 bits)
    ///
    /// The low six bits summarize [`MeasurementFlags`] categories; the top two
    /// select the time encoding of the compact measurement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CompactStateFlags: u8 {
        /// Some data range flag is set
        const DATA_RANGE = 0b0000_0001;
        /// Some data quality flag is set
        const DATA_QUALITY = 0b0000_0010;
        /// Some time quality flag is set
        const TIME_QUALITY = 0b0000_0100;
        /// Some system issue flag is set
        const SYSTEM_ISSUE = 0b0000_1000;
        /// Value was calculated
        const CALCULATED_VALUE = 0b0001_0000;
        /// Value was discarded
        const DISCARDED_VALUE = 0b0010_0000;
        /// Timestamp is an offset from a base time
        const BASE_TIME_OFFSET = 0b0100_0000;
        /// Offset is relative to base time 1 (else 0)
        const TIME_INDEX = 0b1000_0000;
    }
}

const CATEGORY_MAP: [(MeasurementFlags, CompactStateFlags); 6] = [
    (MeasurementFlags::DATA_RANGE_MASK, CompactStateFlags::DATA_RANGE),
    (MeasurementFlags::DATA_QUALITY_MASK, CompactStateFlags::DATA_QUALITY),
    (MeasurementFlags::TIME_QUALITY_MASK, CompactStateFlags::TIME_QUALITY),
    (MeasurementFlags::SYSTEM_ISSUE_MASK, CompactStateFlags::SYSTEM_ISSUE),
    (MeasurementFlags::CALCULATED_VALUE, CompactStateFlags::CALCULATED_VALUE),
    (MeasurementFlags::DISCARDED_VALUE, CompactStateFlags::DISCARDED_VALUE),
];

impl CompactStateFlags {
    /// Create flags from raw byte value (infallible)
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    /// Convert to raw byte value
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.bits()
    }

    /// Collapse full state flags into their compact categories.
    #[must_use]
    pub fn from_measurement_flags(flags: MeasurementFlags) -> Self {
        CATEGORY_MAP
            .iter()
            .filter(|(mask, _)| flags.intersects(*mask))
            .fold(Self::empty(), |acc, (_, compact)| acc | *compact)
    }

    /// Expand compact categories back into full state flags.
    ///
    /// Lossy by construction: each set category yields its whole mask.
    #[must_use]
    pub fn to_measurement_flags(self) -> MeasurementFlags {
        CATEGORY_MAP
            .iter()
            .filter(|(_, compact)| self.contains(*compact))
            .fold(MeasurementFlags::empty(), |acc, (mask, _)| acc | *mask)
    }
}
