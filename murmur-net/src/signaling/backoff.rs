// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use tracing::trace;

use crate::config::BackoffConfig;

/// Exponential backoff with full jitter.
///
/// The upper bound starts at the configured base and doubles with every attempt until it hits the
/// cap. The actual delay is picked uniformly between zero and that bound, which spreads out
/// reconnecting clients after a relay outage.
#[derive(Debug)]
pub struct Backoff {
    attempts: u32,
    config: BackoffConfig,
    rng: ChaCha20Rng,
}

impl Backoff {
    pub fn new(config: BackoffConfig, rng: ChaCha20Rng) -> Self {
        Self {
            attempts: 0,
            config,
            rng,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Upper bound of the delay for the current attempt.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(31));
        self.config
            .base
            .checked_mul(factor)
            .map_or(self.config.cap, |ceiling| ceiling.min(self.config.cap))
    }

    /// Returns the next delay and increments the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling().as_millis() as u64;
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_millis(self.rng.random_range(0..=ceiling))
    }

    pub async fn sleep(&mut self) {
        let delay = self.next_delay();
        if delay.is_zero() {
            return;
        }

        trace!("backoff {} ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
