//! Manually advanced environment for scenarios that run without Turmoil.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use gep_core::env::Environment;
use gep_proto::Ticks;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::sim_env::SIM_EPOCH;

/// Environment whose clocks only move when the scenario advances them.
///
/// Both the monotonic clock and the wall clock advance together, starting
/// from a fixed origin and [`SIM_EPOCH`].
#[derive(Clone)]
pub struct ManualEnv {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl ManualEnv {
    /// Environment at offset zero with a seeded RNG
    pub fn with_seed(seed: u64) -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
        }
    }

    /// Move both clocks forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(std::sync::PoisonError::into_inner) += by;
    }

    /// Time elapsed since the origin
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ManualEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualEnv").field("elapsed", &self.elapsed()).finish_non_exhaustive()
    }
}

impl Environment for ManualEnv {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        self.origin + self.elapsed()
    }

    fn wall_clock(&self) -> Ticks {
        Ticks(SIM_EPOCH.0 + Ticks::from_duration(self.elapsed()).0)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner).fill_bytes(buffer);
    }
}
