//! [`Environment`] backed by Turmoil's virtual clock.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use gep_core::env::Environment;
use gep_proto::Ticks;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall-clock reading at the start of every simulation (2022-09-16 08:00 UTC)
pub const SIM_EPOCH: Ticks = Ticks(637_989_120_000_000_000);

/// Environment for publishers and subscribers running as Turmoil hosts.
///
/// Monotonic time is Turmoil's simulated clock. The wall clock starts at
/// [`SIM_EPOCH`] and moves with it, so compact base times and frame release
/// reproduce between runs. Random bytes come from a seeded ChaCha20 stream,
/// which makes cipher keys and IVs repeat for the same seed.
///
/// Construct it inside a host or client closure; `new()` and `now()` panic
/// outside a running simulation.
#[derive(Clone)]
pub struct SimEnv {
    /// Shared across clones so the RNG sequence advances for everyone.
    /// Turmoil is single-threaded, so this Mutex never blocks.
    rng: Arc<Mutex<ChaCha20Rng>>,
    origin: std::time::Instant,
}

impl SimEnv {
    /// Seed 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub fn with_seed(seed: u64) -> Self {
        tracing::debug!(seed, "simulation environment seeded");
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            origin: tokio::time::Instant::now().into(),
        }
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into()
    }

    fn wall_clock(&self) -> Ticks {
        let elapsed = self.now().saturating_duration_since(self.origin);
        Ticks(SIM_EPOCH.0 + Ticks::from_duration(elapsed).0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, dest: &mut [u8]) {
        self.rng
            .lock()
            .unwrap_or_else(|e| unreachable!("RNG mutex poisoned in single-threaded context: {}", e))
            .fill_bytes(dest);
    }
}
