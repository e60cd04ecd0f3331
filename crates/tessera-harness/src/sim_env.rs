//! Deterministic [`Environment`] for simulated members.
//!
//! A world has one root seed. Each member draws from its own ChaCha20 stream
//! derived from that seed and its id, so a member's session id depends only
//! on the world seed and its name, never on when it was added.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use tessera_core::env::Environment;
use tessera_proto::MemberId;

/// Simulation environment on tokio's clock with a seeded RNG.
///
/// `now()` reads tokio's clock, which inside a turmoil simulation (or a
/// paused tokio runtime) only moves when the simulation advances it.
/// Clones share the RNG stream.
#[derive(Clone)]
pub struct SimEnv {
    seed: u64,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// World environment with seed 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// World environment with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed, rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }

    /// The world seed this environment was built from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Environment of `member`: same clock, own RNG stream keyed by
    /// sha256(seed ‖ member id).
    pub fn for_member(&self, member: &MemberId) -> SimEnv {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_be_bytes());
        hasher.update(member.as_str().as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self { seed: self.seed, rng: Arc::new(Mutex::new(ChaCha20Rng::from_seed(key))) }
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
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, dest: &mut [u8]) {
        // A panic mid-draw leaves the stream usable; keep drawing from it.
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(dest);
    }
}
