//! Environment abstraction for deterministic testing.
//!
//! The state machines in this crate never read a clock or an entropy source:
//! they take `now` as an argument. Something still has to produce those
//! values, and that something is an [`Environment`]:
//!
//! - Deterministic Simulation: `SimEnv` (tessera-harness) uses tokio's paused
//!   clock and a seeded RNG, allowing perfect bug reproduction.
//! - Production: a driver backed by the system clock and OS entropy.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Determinism: Given the same seed, `random_bytes()` produces the same
//!   sequence
//! - Isolation: Implementations must not share global state

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleeping.
///
/// Only driver code holds an environment. Session logic receives the values it
/// produces (`now`, a fresh session id) as plain arguments.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Type representing a point in time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Returns the current time. Never decreases.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait, used by drivers between ticks.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// Production implementations MUST use a cryptographically secure source.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Used for fresh [`tessera_proto::SessionId`]s.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}
