//! Command and response codes for GEP frames.
//!
//! Commands flow client to server as a single leading byte; responses flow
//! server to client as the first byte of the 6-byte response header.
//!
//! # Code Ranges
//!
//! - `0x00-0x09`: Session commands
//! - `0xD0-0xDF`: User-defined commands
//! - `0x80-0x8A`: Session responses
//! - `0xE0-0xEF`: User-defined responses
//! - `0xFF`: Keep-alive (`NoOP`)

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Client-to-server command codes
///
/// # Security
///
/// - **Unknown Codes**: [`ServerCommand::from_u8`] returns `None` for unknown
///   values. Sessions answer them with a `Failed` response instead of
///   dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ServerCommand {
    /// Authenticate with the shared secret (Gateway security mode)
    Authenticate = 0x00,
    /// Request the catalog snapshot
    MetaDataRefresh = 0x01,
    /// Create or replace the subscription
    Subscribe = 0x02,
    /// Remove the subscription
    Unsubscribe = 0x03,
    /// Rotate the payload cipher keys
    RotateCipherKeys = 0x04,
    /// Change the subscription's processing interval
    UpdateProcessingInterval = 0x05,
    /// Negotiate encoding, serialization and compression
    DefineOperationalModes = 0x06,
    /// Acknowledge a notification
    ConfirmNotification = 0x07,
    /// Acknowledge a buffer block
    ConfirmBufferBlock = 0x08,
    /// Publish measurements to the server
    PublishCommandMeasurements = 0x09,

    // User commands (0xD0-0xDF)
    /// User-defined command 00
    UserCommand00 = 0xD0,
    /// User-defined command 01
    UserCommand01 = 0xD1,
    /// User-defined command 02
    UserCommand02 = 0xD2,
    /// User-defined command 03
    UserCommand03 = 0xD3,
    /// User-defined command 04
    UserCommand04 = 0xD4,
    /// User-defined command 05
    UserCommand05 = 0xD5,
    /// User-defined command 06
    UserCommand06 = 0xD6,
    /// User-defined command 07
    UserCommand07 = 0xD7,
    /// User-defined command 08
    UserCommand08 = 0xD8,
    /// User-defined command 09
    UserCommand09 = 0xD9,
    /// User-defined command 10
    UserCommand10 = 0xDA,
    /// User-defined command 11
    UserCommand11 = 0xDB,
    /// User-defined command 12
    UserCommand12 = 0xDC,
    /// User-defined command 13
    UserCommand13 = 0xDD,
    /// User-defined command 14
    UserCommand14 = 0xDE,
    /// User-defined command 15
    UserCommand15 = 0xDF,
}

impl ServerCommand {
    /// Convert to raw u8 value
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from raw u8 value
    ///
    /// Returns `None` if the value doesn't correspond to a known command.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Authenticate),
            0x01 => Some(Self::MetaDataRefresh),
            0x02 => Some(Self::Subscribe),
            0x03 => Some(Self::Unsubscribe),
            0x04 => Some(Self::RotateCipherKeys),
            0x05 => Some(Self::UpdateProcessingInterval),
            0x06 => Some(Self::DefineOperationalModes),
            0x07 => Some(Self::ConfirmNotification),
            0x08 => Some(Self::ConfirmBufferBlock),
            0x09 => Some(Self::PublishCommandMeasurements),

            0xD0 => Some(Self::UserCommand00),
            0xD1 => Some(Self::UserCommand01),
            0xD2 => Some(Self::UserCommand02),
            0xD3 => Some(Self::UserCommand03),
            0xD4 => Some(Self::UserCommand04),
            0xD5 => Some(Self::UserCommand05),
            0xD6 => Some(Self::UserCommand06),
            0xD7 => Some(Self::UserCommand07),
            0xD8 => Some(Self::UserCommand08),
            0xD9 => Some(Self::UserCommand09),
            0xDA => Some(Self::UserCommand10),
            0xDB => Some(Self::UserCommand11),
            0xDC => Some(Self::UserCommand12),
            0xDD => Some(Self::UserCommand13),
            0xDE => Some(Self::UserCommand14),
            0xDF => Some(Self::UserCommand15),
            _ => None,
        }
    }

    /// Index of a user command (`0..=15`), `None` for session commands
    #[must_use]
    pub const fn user_index(self) -> Option<u8> {
        let code = self as u8;
        if code >= 0xD0 && code <= 0xDF { Some(code - 0xD0) } else { None }
    }

    /// Matching user response code for a user command
    #[must_use]
    pub const fn user_response(self) -> Option<ServerResponse> {
        match self.user_index() {
            Some(index) => ServerResponse::from_u8(0xE0 + index),
            None => None,
        }
    }
}

/// Server-to-client response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ServerResponse {
    /// Command succeeded
    Succeeded = 0x80,
    /// Command failed
    Failed = 0x81,
    /// Measurement data packet
    DataPacket = 0x82,
    /// New signal index cache
    UpdateSignalIndexCache = 0x83,
    /// New compact base times
    UpdateBaseTimes = 0x84,
    /// New cipher keys
    UpdateCipherKeys = 0x85,
    /// Timestamp of the first published measurement
    DataStartTime = 0x86,
    /// Temporal processing finished
    ProcessingComplete = 0x87,
    /// Sequence-numbered raw payload
    BufferBlock = 0x88,
    /// Notification text
    Notify = 0x89,
    /// Publisher configuration changed
    ConfigurationChanged = 0x8A,

    // User responses (0xE0-0xEF)
    /// User-defined response 00
    UserResponse00 = 0xE0,
    /// User-defined response 01
    UserResponse01 = 0xE1,
    /// User-defined response 02
    UserResponse02 = 0xE2,
    /// User-defined response 03
    UserResponse03 = 0xE3,
    /// User-defined response 04
    UserResponse04 = 0xE4,
    /// User-defined response 05
    UserResponse05 = 0xE5,
    /// User-defined response 06
    UserResponse06 = 0xE6,
    /// User-defined response 07
    UserResponse07 = 0xE7,
    /// User-defined response 08
    UserResponse08 = 0xE8,
    /// User-defined response 09
    UserResponse09 = 0xE9,
    /// User-defined response 10
    UserResponse10 = 0xEA,
    /// User-defined response 11
    UserResponse11 = 0xEB,
    /// User-defined response 12
    UserResponse12 = 0xEC,
    /// User-defined response 13
    UserResponse13 = 0xED,
    /// User-defined response 14
    UserResponse14 = 0xEE,
    /// User-defined response 15
    UserResponse15 = 0xEF,

    /// Keep-alive, no payload
    NoOp = 0xFF,
}

impl ServerResponse {
    /// Convert to raw u8 value
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from raw u8 value
    ///
    /// Returns `None` if the value doesn't correspond to a known response.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(Self::Succeeded),
            0x81 => Some(Self::Failed),
            0x82 => Some(Self::DataPacket),
            0x83 => Some(Self::UpdateSignalIndexCache),
            0x84 => Some(Self::UpdateBaseTimes),
            0x85 => Some(Self::UpdateCipherKeys),
            0x86 => Some(Self::DataStartTime),
            0x87 => Some(Self::ProcessingComplete),
            0x88 => Some(Self::BufferBlock),
            0x89 => Some(Self::Notify),
            0x8A => Some(Self::ConfigurationChanged),

            0xE0 => Some(Self::UserResponse00),
            0xE1 => Some(Self::UserResponse01),
            0xE2 => Some(Self::UserResponse02),
            0xE3 => Some(Self::UserResponse03),
            0xE4 => Some(Self::UserResponse04),
            0xE5 => Some(Self::UserResponse05),
            0xE6 => Some(Self::UserResponse06),
            0xE7 => Some(Self::UserResponse07),
            0xE8 => Some(Self::UserResponse08),
            0xE9 => Some(Self::UserResponse09),
            0xEA => Some(Self::UserResponse10),
            0xEB => Some(Self::UserResponse11),
            0xEC => Some(Self::UserResponse12),
            0xED => Some(Self::UserResponse13),
            0xEE => Some(Self::UserResponse14),
            0xEF => Some(Self::UserResponse15),

            0xFF => Some(Self::NoOp),
            _ => None,
        }
    }

    /// Index of a user response (`0..=15`), `None` otherwise
    #[must_use]
    pub const fn user_index(self) -> Option<u8> {
        let code = self as u8;
        if code >= 0xE0 && code <= 0xEF { Some(code - 0xE0) } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        for value in 0u8..=0xFF {
            if let Some(command) = ServerCommand::from_u8(value) {
                assert_eq!(command.to_u8(), value);
            }
        }
    }

    #[test]
    fn response_round_trip() {
        for value in 0u8..=0xFF {
            if let Some(response) = ServerResponse::from_u8(value) {
                assert_eq!(response.to_u8(), value);
            }
        }
    }

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(ServerCommand::Authenticate.to_u8(), 0x00);
        assert_eq!(ServerCommand::PublishCommandMeasurements.to_u8(), 0x09);
        assert_eq!(ServerResponse::Succeeded.to_u8(), 0x80);
        assert_eq!(ServerResponse::ConfigurationChanged.to_u8(), 0x8A);
        assert_eq!(ServerResponse::NoOp.to_u8(), 0xFF);
    }

    #[test]
    fn invalid_codes() {
        assert_eq!(ServerCommand::from_u8(0x0A), None);
        assert_eq!(ServerCommand::from_u8(0x80), None);
        assert_eq!(ServerResponse::from_u8(0x8B), None);
        assert_eq!(ServerResponse::from_u8(0x00), None);
    }

    #[test]
    fn user_commands_pair_with_user_responses() {
        assert_eq!(ServerCommand::UserCommand00.user_index(), Some(0));
        assert_eq!(ServerCommand::UserCommand15.user_index(), Some(15));
        assert_eq!(ServerCommand::Subscribe.user_index(), None);
        assert_eq!(
            ServerCommand::UserCommand07.user_response(),
            Some(ServerResponse::UserResponse07)
        );
        assert_eq!(ServerResponse::UserResponse15.user_index(), Some(15));
        assert_eq!(ServerResponse::NoOp.user_index(), None);
    }
}
