// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Mutex;

use rand_chacha::rand_core::{SeedableRng, TryRngCore};
use thiserror::Error;

/// Cryptographically-secure random number generator backed by ChaCha20, seeded from the operating
/// system.
///
/// Every key in this crate is derived from bytes of this generator. A failure to collect
/// randomness is fatal and is never retried silently.
#[derive(Debug)]
pub struct Rng {
    rng: Mutex<rand_chacha::ChaCha20Rng>,
}

impl Default for Rng {
    fn default() -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_os_rng()),
        }
    }
}

#[cfg(any(test, feature = "test_utils"))]
impl Rng {
    /// Deterministic generator for reproducible tests.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(rand_chacha::ChaCha20Rng::from_seed(seed)),
        }
    }
}

impl Rng {
    pub fn random_array<const N: usize>(&self) -> Result<[u8; N], RngError> {
        let mut out = [0u8; N];
        self.fill(&mut out)?;
        Ok(out)
    }

    pub fn random_vec(&self, len: usize) -> Result<Vec<u8>, RngError> {
        let mut out = vec![0u8; len];
        self.fill(&mut out)?;
        Ok(out)
    }

    fn fill(&self, out: &mut [u8]) -> Result<(), RngError> {
        let mut rng = self.rng.lock().map_err(|_| RngError::LockPoisoned)?;
        rng.try_fill_bytes(out)
            .map_err(|_| RngError::NotEnoughRandomness)
    }
}

#[derive(Debug, Error)]
pub enum RngError {
    #[error("rng lock is poisoned")]
    LockPoisoned,

    #[error("unable to collect enough randomness")]
    NotEnoughRandomness,
}

#[cfg(test)]
mod tests {
    use super::Rng;

    #[test]
    fn seeded_generators_agree() {
        let sample_1 = Rng::from_seed([7; 32]).random_vec(64).unwrap();
        let sample_2 = Rng::from_seed([7; 32]).random_vec(64).unwrap();
        assert_eq!(sample_1, sample_2);

        let sample_3 = Rng::from_seed([8; 32]).random_vec(64).unwrap();
        assert_ne!(sample_1, sample_3);
    }

    #[test]
    fn consecutive_draws_differ() {
        let rng = Rng::default();
        let a: [u8; 32] = rng.random_array().unwrap();
        let b: [u8; 32] = rng.random_array().unwrap();
        assert_ne!(a, b);
    }
}
