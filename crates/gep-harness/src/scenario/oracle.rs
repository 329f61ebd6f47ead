//! Oracle functions for scenario verification.
//!
//! Oracle functions run at the end of scenarios to verify global consistency.
//! They receive a snapshot of the entire world state and assert invariants.

use gep_core::{SessionState, SubscriberState};
use gep_proto::SignalId;

use crate::scenario::World;

/// Oracle function type.
///
/// Receives immutable reference to world state and returns:
/// - `Ok(())` if all invariants hold
/// - `Err(message)` if verification fails
pub type OracleFn = Box<dyn FnOnce(&World) -> Result<(), String>>;

/// Both ends agree the subscription is active.
pub fn subscribed() -> OracleFn {
    Box::new(|world| {
        let publisher_side = world.session().map(|s| s.state());
        match (world.subscriber().state(), publisher_side) {
            (SubscriberState::Subscribed, Some(SessionState::Subscribed)) => Ok(()),
            (client, server) => Err(format!("subscriber {client:?}, publisher session {server:?}")),
        }
    })
}

/// Exactly `count` measurements reached the subscriber.
pub fn received(count: usize) -> OracleFn {
    Box::new(move |world| {
        let got = world.measurements().len();
        if got == count { Ok(()) } else { Err(format!("expected {count} measurements, received {got}")) }
    })
}

/// Every delivered measurement belongs to `signals`.
pub fn only_signals(signals: Vec<SignalId>) -> OracleFn {
    Box::new(move |world| {
        match world.measurements().iter().find(|m| !signals.contains(&m.signal_id)) {
            Some(stray) => Err(format!("unexpected signal {} delivered", stray.signal_id)),
            None => Ok(()),
        }
    })
}

/// The subscriber never restarted its connection cycle.
pub fn no_restarts() -> OracleFn {
    Box::new(|world| match world.restarts() {
        [] => Ok(()),
        reasons => Err(format!("subscriber restarted: {reasons:?}")),
    })
}

/// No buffer block waits for confirmation on the publisher.
pub fn buffer_blocks_settled() -> OracleFn {
    Box::new(|world| {
        let pending = world.session().and_then(|s| s.subscription()).map_or(0, |s| s.unconfirmed_buffer_blocks());
        if pending == 0 { Ok(()) } else { Err(format!("{pending} buffer blocks unconfirmed")) }
    })
}

/// Combine multiple oracles into one.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |world| {
        for oracle in oracles {
            oracle(world)?;
        }
        Ok(())
    })
}
