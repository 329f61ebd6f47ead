//! Typed command and response payloads.
//!
//! Commands form a closed set: [`Command`] covers every known command code
//! and [`Command::from_frame`] rejects the rest with
//! [`ProtocolError::InvalidCommand`], which sessions answer with `Failed`.
//!
//! Strings inside payloads use the session's negotiated [`TextEncoding`], so
//! every encode/decode takes one.

pub mod command;
pub mod response;

use bytes::{BufMut, Bytes};

use self::command::get_u32;
pub use self::{
    command::{AuthenticateRequest, MetadataRefreshRequest, SubscribeRequest},
    response::{BufferBlock, Notification},
};
use crate::{
    CommandFrame, Measurement, OperationalModes, ServerCommand, TextEncoding,
    errors::{ProtocolError, Result},
    measurement::{decode_full_batch, encode_full_batch},
};

/// A decoded client command
///
/// # Invariants
///
/// - **Code Uniqueness**: each variant maps to exactly one [`ServerCommand`]
///   (user commands carry theirs), so encoding then decoding with the same
///   text encoding yields an equal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Present a sealed authentication token
    Authenticate(AuthenticateRequest),
    /// Request the catalog snapshot
    MetaDataRefresh(MetadataRefreshRequest),
    /// Create or replace the subscription
    Subscribe(SubscribeRequest),
    /// Drop the subscription
    Unsubscribe,
    /// Rotate cipher keys now
    RotateCipherKeys,
    /// New processing interval in milliseconds (-1 = default)
    UpdateProcessingInterval(i32),
    /// Negotiate encoding, serialization and compression
    DefineOperationalModes(OperationalModes),
    /// Acknowledge the notification with this hash
    ConfirmNotification(u32),
    /// Acknowledge the buffer block with this sequence
    ConfirmBufferBlock(u32),
    /// Measurements published by the client
    PublishCommandMeasurements(Vec<Measurement>),
    /// User-defined command with a raw payload
    User {
        /// One of `UserCommand00..=UserCommand15`
        command: ServerCommand,
        /// Opaque payload
        payload: Bytes,
    },
}

impl Command {
    /// Command code for this variant
    #[must_use]
    pub const fn command(&self) -> ServerCommand {
        match self {
            Self::Authenticate(_) => ServerCommand::Authenticate,
            Self::MetaDataRefresh(_) => ServerCommand::MetaDataRefresh,
            Self::Subscribe(_) => ServerCommand::Subscribe,
            Self::Unsubscribe => ServerCommand::Unsubscribe,
            Self::RotateCipherKeys => ServerCommand::RotateCipherKeys,
            Self::UpdateProcessingInterval(_) => ServerCommand::UpdateProcessingInterval,
            Self::DefineOperationalModes(_) => ServerCommand::DefineOperationalModes,
            Self::ConfirmNotification(_) => ServerCommand::ConfirmNotification,
            Self::ConfirmBufferBlock(_) => ServerCommand::ConfirmBufferBlock,
            Self::PublishCommandMeasurements(_) => ServerCommand::PublishCommandMeasurements,
            Self::User { command, .. } => *command,
        }
    }

    /// Encode the payload (without the command byte).
    ///
    /// # Errors
    ///
    /// Returns a text encoding error if a string cannot be represented.
    pub fn encode(&self, encoding: TextEncoding, dst: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Authenticate(inner) => inner.encode(dst),
            Self::MetaDataRefresh(inner) => inner.encode(encoding, dst)?,
            Self::Subscribe(inner) => inner.encode(encoding, dst)?,
            Self::Unsubscribe | Self::RotateCipherKeys => {},
            Self::UpdateProcessingInterval(interval) => dst.put_i32(*interval),
            Self::DefineOperationalModes(modes) => dst.put_u32(modes.to_u32()),
            Self::ConfirmNotification(hash) => dst.put_u32(*hash),
            Self::ConfirmBufferBlock(sequence) => dst.put_u32(*sequence),
            Self::PublishCommandMeasurements(measurements) => encode_full_batch(measurements, dst),
            Self::User { payload, .. } => dst.put_slice(payload),
        }
        Ok(())
    }

    /// Decode the payload of a known command.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is shorter than the command's fixed
    /// layout, a length field is out of range, or text fails to decode.
    pub fn decode(command: ServerCommand, payload: &[u8], encoding: TextEncoding) -> Result<Self> {
        let decoded = match command {
            ServerCommand::Authenticate => Self::Authenticate(AuthenticateRequest::decode(payload)?),
            ServerCommand::MetaDataRefresh => {
                Self::MetaDataRefresh(MetadataRefreshRequest::decode(payload, encoding)?)
            },
            ServerCommand::Subscribe => Self::Subscribe(SubscribeRequest::decode(payload, encoding)?),
            ServerCommand::Unsubscribe => Self::Unsubscribe,
            ServerCommand::RotateCipherKeys => Self::RotateCipherKeys,
            ServerCommand::UpdateProcessingInterval => {
                #[allow(clippy::cast_possible_wrap)]
                let interval = get_u32(payload, "processing interval")? as i32;
                Self::UpdateProcessingInterval(interval)
            },
            ServerCommand::DefineOperationalModes => Self::DefineOperationalModes(
                OperationalModes::from_u32(get_u32(payload, "operational modes")?),
            ),
            ServerCommand::ConfirmNotification => {
                Self::ConfirmNotification(get_u32(payload, "confirm notification")?)
            },
            ServerCommand::ConfirmBufferBlock => {
                Self::ConfirmBufferBlock(get_u32(payload, "confirm buffer block")?)
            },
            ServerCommand::PublishCommandMeasurements => {
                Self::PublishCommandMeasurements(decode_full_batch(payload)?)
            },
            user => Self::User { command: user, payload: Bytes::copy_from_slice(payload) },
        };
        Ok(decoded)
    }

    /// Encode into a command frame.
    ///
    /// # Errors
    ///
    /// Propagates [`Command::encode`] failures.
    pub fn into_frame(&self, encoding: TextEncoding) -> Result<CommandFrame> {
        let mut buf = Vec::new();
        self.encode(encoding, &mut buf)?;
        Ok(CommandFrame::new(self.command(), buf))
    }

    /// Decode a command frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidCommand`] for unknown command bytes,
    /// otherwise the [`Command::decode`] errors.
    pub fn from_frame(frame: &CommandFrame, encoding: TextEncoding) -> Result<Self> {
        let command = frame.command().ok_or(ProtocolError::InvalidCommand(frame.code()))?;
        Self::decode(command, &frame.payload, encoding)
    }
}
