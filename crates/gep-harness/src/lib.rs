//! Deterministic simulation harness for the gateway exchange protocol.
//!
//! This crate provides Turmoil-based implementations of the `Environment`
//! and `Transport` traits, async drivers that run publisher and subscriber
//! state machines over them, and an in-memory scenario framework for
//! oracle-checked tests on a manual clock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod driver;
pub mod scenario;
pub mod sim_env;
pub mod sim_transport;

pub use driver::{HostEvent, PublisherHost, SubscriberLink};
pub use sim_env::SimEnv;
pub use sim_transport::{SimDataChannel, SimTransport};
