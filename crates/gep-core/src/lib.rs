//! GEP session engine
//!
//! Pure state machines for both ends of a Gateway Exchange Protocol
//! connection. Nothing here opens a socket, reads a clock or spawns a task;
//! drivers feed frames and instants in and carry the returned actions out.
//!
//! # Architecture
//!
//! ```text
//!      ┌──────────────────────────────────┐
//!      │ gep-core                         │
//!      │ - Publisher / Session            │
//!      │ - Subscriber                     │
//!      │ - Cipher keys, codecs, caches    │
//!      └──────────────────────────────────┘
//!         ↓                           ↓
//! ┌──────────────────┐      ┌──────────────────┐
//! │ gep-harness      │      │ host application │
//! │ (Turmoil)        │      │ (Tokio)          │
//! │ - Virtual time   │      │ - Real network   │
//! │ - Seeded RNG     │      │ - System clock   │
//! │ - Fault inject   │      │ - OS entropy     │
//! └──────────────────┘      └──────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - No I/O in core: never call `tokio::spawn`, `std::time::Instant::now()`
//!   or `rand::thread_rng()` directly
//! - All side effects go through the [`env::Environment`] trait
//! - Given the same inputs and environment state, the same actions come out
//!
//! # Modules
//!
//! - [`publisher`]: per-connection fan-out and the shared rotation timer
//! - [`session`]: server side of one connection (command dispatch, auth guard)
//! - [`subscription`]: what a session delivers and how
//! - [`subscriber`]: client side of one connection
//! - [`cipher`], [`auth`]: payload keys and Gateway authentication
//! - [`compression`], [`data_packet`], [`signal_index`]: payload codecs
//! - [`buffer_block`], [`alignment`], [`monitor`]: delivery bookkeeping
//! - [`transport`], [`env`], [`config`], [`error`]: plumbing

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod alignment;
pub mod auth;
pub mod buffer_block;
pub mod cipher;
pub mod compression;
pub mod config;
pub mod data_packet;
pub mod env;
pub mod error;
pub mod monitor;
pub mod publisher;
pub mod session;
pub mod signal_index;
pub mod subscriber;
pub mod subscription;
pub mod transport;

pub use config::{PublisherConfig, SubscriberConfig, SubscriptionSettings};
pub use env::Environment;
pub use error::{CipherError, CompressionError, SessionError};
pub use publisher::{Publisher, PublisherAction};
pub use session::{ConnectionId, ConnectionSecurity, Session, SessionAction, SessionContext, SessionState};
pub use subscriber::{Subscriber, SubscriberAction, SubscriberState};
