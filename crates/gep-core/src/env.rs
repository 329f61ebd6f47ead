//! Time and randomness behind a trait, so sessions replay under simulation.
//!
//! The `Environment` trait decouples the session engine from system resources
//! (clocks and randomness). Publisher and subscriber state machines never read
//! a clock or an entropy source directly:
//!
//! - Monotonic time (`now`) drives throttles and timers: cipher rotation
//!   spacing, keep-alives, buffer block retransmission, data-loss detection.
//! - Wall-clock time (`wall_clock`) supplies measurement-domain timestamps:
//!   compact base times and synchronized frame release.
//! - Randomness (`random_bytes`) supplies cipher keys, IVs and sealing nonces.
//!
//! `SimEnv` in gep-harness runs on Turmoil's virtual clock with a seeded
//! ChaCha20 stream. A host embedding the engine supplies its own environment
//! over the system clock and OS entropy. For a given seed every
//! implementation must replay the same random sequence, and `now()` must
//! never move backwards.

use std::time::Duration;

use gep_proto::Ticks;

/// Clocks, entropy and sleeping for the session engine.
///
/// `random_bytes` produces key material, so a production environment must
/// draw it from a cryptographically secure source.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Point in monotonic time; subtracting two yields the elapsed span.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Returns the current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Returns the current wall-clock time in 100 ns ticks.
    ///
    /// Only used for values that end up on the wire next to measurement
    /// timestamps. Never used for throttling.
    fn wall_clock(&self) -> Ticks;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code sleeps. State machines expose `tick(now)` instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills `buffer` from the environment's entropy source.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Useful for subscriber identifiers.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Elapsed time between two instants, zero if `later` is not after `earlier`.
pub(crate) fn elapsed<I>(earlier: I, later: I) -> Duration
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    if later > earlier { later - earlier } else { Duration::ZERO }
}
