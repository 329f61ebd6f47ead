//! Scenario testing framework for deterministic simulation tests.
//!
//! This module provides a declarative API for writing scenario-based tests
//! that follow the Oracle Pattern. A scenario wires one publisher to one
//! subscriber through in-memory byte pipes, runs scripted steps on a manual
//! clock, and always ends in an oracle.

mod builder;
mod clock;
pub mod oracle;
mod world;

pub use builder::{RunnableScenario, Scenario};
pub use clock::ManualEnv;
pub use oracle::OracleFn;
pub use world::World;
