//! Error types for the GEP session engine.
//!
//! This module provides strongly-typed errors for different layers:
//! - [`CipherError`]: key rotation, sealing and opening
//! - [`CompressionError`]: GZip and the stateful payload codec
//! - [`SessionError`]: command handling and connection life cycle
//!
//! A `SessionError` from a command handler never closes the connection. The
//! session's dispatch guard turns it into a `Failed` response carrying the
//! error's `Display` text.

use std::{fmt, io, time::Duration};

use gep_proto::{ProtocolError, ServerCommand};
use thiserror::Error;

/// Cipher key manager and sealing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Rotation requested before the minimum spacing elapsed
    #[error("Cipher key rotation skipped, keys were already rotated within last second.")]
    RotationTooSoon {
        /// Time since the previous rotation
        elapsed: Duration,
    },

    /// No keys have been established
    #[error("no cipher keys established")]
    NoKeys,

    /// Authenticated encryption failed to seal
    #[error("failed to seal payload")]
    Seal,

    /// Ciphertext failed authentication or was truncated
    #[error("failed to open sealed payload")]
    Open,

    /// Serialized key material is malformed
    #[error("malformed cipher key blob: {0}")]
    MalformedKeys(&'static str),
}

/// Compression errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    /// GZip stream failed
    #[error("gzip error: {0}")]
    Gzip(String),

    /// Stateful codec failed
    #[error("codec error: {0}")]
    Codec(String),

    /// Decompressed output exceeds the allowed size
    #[error("decompressed size exceeds {limit} bytes")]
    TooLarge {
        /// Size limit in bytes
        limit: usize,
    },

    /// Codec sequence does not continue the previous packet
    #[error("codec sequence desynchronized: expected {expected:?}, got {actual}")]
    Desync {
        /// Next sequence the decoder expected (`None` before the first reset)
        expected: Option<u16>,
        /// Sequence found in the packet
        actual: u16,
    },
}

/// Errors raised while handling commands and responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Frame or payload failed to parse
    Protocol(ProtocolError),

    /// Command requires an authenticated connection
    NotAuthenticated {
        /// Rejected command
        command: ServerCommand,
    },

    /// Authentication token was rejected
    AuthenticationFailed {
        /// Why the token was rejected (logged, never sent to the peer)
        reason: &'static str,
    },

    /// Command requires an active subscription
    NotSubscribed {
        /// Rejected command
        command: ServerCommand,
    },

    /// Request is well-formed but refused by policy
    Rejected {
        /// Human-readable reason sent back to the peer
        reason: String,
    },

    /// A connection-string setting failed to parse
    InvalidSetting {
        /// Setting key
        key: String,
        /// Offending value
        value: String,
    },

    /// Cipher failure
    Cipher(CipherError),

    /// Compression failure
    Compression(CompressionError),

    /// Operation not allowed in the current state
    InvalidState {
        /// State name
        state: &'static str,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// No data arrived within the data-loss interval
    DataLoss {
        /// Time since the last data packet
        elapsed: Duration,
    },

    /// Too many parse faults inside the parsing-exception window
    TooManyParseErrors {
        /// Faults counted in the window
        count: usize,
        /// Window length
        window: Duration,
    },

    /// Underlying transport error
    Transport(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(err) => write!(f, "{err}"),
            Self::NotAuthenticated { command } => {
                write!(f, "Command {command:?} requires an authenticated connection")
            },
            Self::AuthenticationFailed { .. } => write!(f, "Failed to authenticate client"),
            Self::NotSubscribed { command } => {
                write!(f, "Command {command:?} requires an active subscription")
            },
            Self::Rejected { reason } => write!(f, "{reason}"),
            Self::InvalidSetting { key, value } => {
                write!(f, "Invalid value \"{value}\" for setting \"{key}\"")
            },
            Self::Cipher(err) => write!(f, "{err}"),
            Self::Compression(err) => write!(f, "{err}"),
            Self::InvalidState { state, operation } => {
                write!(f, "invalid state: cannot {operation} while {state}")
            },
            Self::DataLoss { elapsed } => write!(f, "no data received for {elapsed:?}"),
            Self::TooManyParseErrors { count, window } => {
                write!(f, "{count} parsing errors within {window:?}")
            },
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    /// Returns true if reconnecting may clear the error.
    ///
    /// Data loss, parse-fault storms and transport failures are transient.
    /// Policy and authentication rejections are not: retrying the same
    /// request yields the same answer.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DataLoss { .. } | Self::TooManyParseErrors { .. } | Self::Transport(_)
        )
    }

    /// Returns true for errors logged as security events.
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        matches!(self, Self::NotAuthenticated { .. } | Self::AuthenticationFailed { .. })
    }
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<CipherError> for SessionError {
    fn from(err: CipherError) -> Self {
        Self::Cipher(err)
    }
}

impl From<CompressionError> for SessionError {
    fn from(err: CompressionError) -> Self {
        Self::Compression(err)
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Convert to `io::Error` at the async I/O boundary.
impl From<SessionError> for io::Error {
    fn from(err: SessionError) -> Self {
        let kind = match &err {
            SessionError::DataLoss { .. } => io::ErrorKind::TimedOut,
            SessionError::Transport(_) => io::ErrorKind::Other,
            SessionError::NotAuthenticated { .. } | SessionError::AuthenticationFailed { .. } => {
                io::ErrorKind::PermissionDenied
            },
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err.to_string())
    }
}
