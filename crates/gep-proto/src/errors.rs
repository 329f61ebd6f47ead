//! Error types for the GEP wire format.
//!
//! All errors are structured, testable, and provide actionable information.

use thiserror::Error;

/// Protocol-level errors that can occur during frame parsing and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Frame parsing errors
    /// Buffer is shorter than the fixed header or command byte
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Expected minimum size in bytes
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Payload exceeds maximum allowed size
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Frame is truncated (header claims more data than available)
    #[error("frame truncated: header claims {expected} payload bytes, but only {actual} available")]
    FrameTruncated {
        /// Expected payload size from header
        expected: usize,
        /// Actual bytes available
        actual: usize,
    },

    /// Stream framing marker missing
    #[error("invalid payload marker: {0:02x?}")]
    InvalidMarker([u8; 4]),

    // Validation errors
    /// Unknown command code
    #[error("Unrecognized command code {0:#04x}")]
    InvalidCommand(u8),

    /// Unknown response code
    #[error("unrecognized response code {0:#04x}")]
    InvalidResponse(u8),

    /// Typed payload is shorter than its fixed layout requires
    #[error("{context} payload too short: expected at least {expected} bytes, got {actual}")]
    PayloadTooShort {
        /// What was being parsed
        context: &'static str,
        /// Minimum bytes needed
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Declared length field is outside its permitted range
    #[error("{context} length {length} outside permitted range {min}..={max}")]
    LengthOutOfRange {
        /// What was being parsed
        context: &'static str,
        /// Declared length
        length: usize,
        /// Smallest permitted
        min: usize,
        /// Largest permitted
        max: usize,
    },

    /// Text could not be decoded in the negotiated encoding
    #[error("invalid {encoding} text")]
    InvalidText {
        /// Encoding name
        encoding: &'static str,
    },

    /// Text contains characters the negotiated encoding cannot represent
    #[error("text not representable in {encoding}")]
    Unrepresentable {
        /// Encoding name
        encoding: &'static str,
    },

    /// Compact measurement references a runtime index the cache does not hold
    #[error("unknown runtime index {0}")]
    UnknownRuntimeIndex(u16),

    /// Signal has no runtime index in the active cache
    #[error("signal {0} is not in the signal index cache")]
    UnmappedSignal(uuid::Uuid),

    /// Signal index cache entries are not numbered `0..count`
    #[error("signal index cache entry {position} carries index {actual}")]
    NonDenseIndex {
        /// Position of the entry
        position: usize,
        /// Index found on the wire
        actual: u16,
    },

    /// Signal appears twice in a signal index cache
    #[error("signal {0} appears twice in the signal index cache")]
    DuplicateSignal(uuid::Uuid),

    /// Measurement count does not match the bytes that follow
    #[error("measurement count mismatch: header says {declared}, parsed {parsed}")]
    CountMismatch {
        /// Count from the packet header
        declared: usize,
        /// Measurements actually parsed
        parsed: usize,
    },

    /// Invalid flag combination
    #[error("invalid flags: {0:#04x}")]
    InvalidFlags(u8),
}

/// Convenient Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
