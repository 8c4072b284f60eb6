//! Nonce and salt randomness.
//!
//! The default source is the operating system RNG. With `norandom` the engine
//! uses a ChaCha-based generator seeded once from process-local entropy
//! (pid, clock, addresses) mixed through BLAKE3. That is weaker than the OS
//! source: its seed is guessable by anyone who can bound those inputs, so
//! only use it on hosts where the OS source blocks or is unavailable.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::{rngs::StdRng, RngCore, SeedableRng};

use super::{CryptError, NONCE_SIZE};

static SEED_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub enum RandomSource {
    Os,
    Seeded(Mutex<StdRng>),
}

impl RandomSource {
    pub fn new(norandom: bool) -> Self {
        if norandom {
            Self::seeded()
        } else {
            Self::Os
        }
    }

    /// Deterministic generator seeded from process-local state.
    pub fn seeded() -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("cloudfs norandom seed v1");
        hasher.update(&std::process::id().to_le_bytes());
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        hasher.update(&now.to_le_bytes());
        hasher.update(&SEED_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        let local = 0u8;
        hasher.update(&(&local as *const u8 as usize).to_le_bytes());
        hasher.update(format!("{:?}", std::thread::current().id()).as_bytes());
        Self::from_seed(*hasher.finalize().as_bytes())
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::Seeded(Mutex::new(StdRng::from_seed(seed)))
    }

    pub fn is_os(&self) -> bool {
        matches!(self, Self::Os)
    }

    pub fn fill(&self, buf: &mut [u8]) -> Result<(), CryptError> {
        match self {
            Self::Os => getrandom::getrandom(buf).map_err(|e| CryptError::Random(e.to_string())),
            Self::Seeded(rng) => {
                rng.lock().fill_bytes(buf);
                Ok(())
            }
        }
    }

    pub fn nonce(&self) -> Result<[u8; NONCE_SIZE], CryptError> {
        let mut nonce = [0u8; NONCE_SIZE];
        self.fill(&mut nonce)?;
        Ok(nonce)
    }
}
