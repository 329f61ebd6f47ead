//! # GEP Protocol: Wire Format
//!
//! This crate implements the binary wire format of the gateway exchange
//! protocol (GEP), a publish/subscribe protocol that streams time-stamped
//! measurements from one publisher to many subscribers.
//!
//! ## Protocol Design
//!
//! - **Commands** (client to server): `[command:1][payload]`
//! - **Responses** (server to client): a 6-byte [`ResponseHeader`]
//!   (`[code:1][in_reply_to:1][length: u32 BE]`) followed by the payload
//! - **Stream framing**: over TCP every frame is wrapped by
//!   [`framing::encode_framed`] with a marker and length word
//!
//! Measurements travel in `DataPacket` responses, either in the 36-byte full
//! format or the compact format, which replaces signal identifiers with 16-bit
//! runtime indices from a [`SignalIndexCache`] and timestamps with offsets
//! from shared base times.
//!
//! ## Scope
//!
//! Pure data: no I/O, no clocks, no cryptography. Sealing, compression and
//! session state live in `gep-core`.
//!
//! ## Security Properties
//!
//! - **No Unsafe Deserialization**: the response header is parsed with
//!   `zerocopy`; everything else is bounds-checked before reading.
//!
//! - **Size Limits**: payloads are limited to 16 MB and every length or count
//!   field is checked against the bytes actually present before allocating.
//!
//! - **Unknown Codes Survive**: unknown command and response bytes are
//!   preserved so sessions can answer them instead of dropping connections.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codes;
pub mod compact;
pub mod data_packet;
pub mod errors;
pub mod flags;
pub mod frame;
pub mod framing;
pub mod header;
pub mod measurement;
pub mod modes;
pub mod payloads;
pub mod signal_index;
pub mod text;

pub use codes::{ServerCommand, ServerResponse};
pub use compact::{BaseTimeOffsets, CompactContext};
pub use data_packet::{MAX_PACKET_SIZE, MeasurementFormat, PacketPrelude, PlainDataPacket};
pub use errors::{ProtocolError, Result};
pub use flags::{CompactStateFlags, DataPacketFlags, MeasurementFlags};
pub use frame::{CommandFrame, ResponseFrame};
pub use header::ResponseHeader;
pub use measurement::{Measurement, SignalId, Ticks};
pub use modes::{CompressionModes, OperationalModes, SecurityMode};
pub use payloads::Command;
pub use signal_index::SignalIndexCache;
pub use text::TextEncoding;
