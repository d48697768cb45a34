//! Jittered exponential backoff for transient transport failures.

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with equal jitter.
///
/// Delay for attempt `n` is drawn uniformly from `[cap_n / 2, cap_n]` where
/// `cap_n = min(base × 2ⁿ, cap)`. The jitter spreads simultaneous retriers
/// (every standby reacting to the same leader expiry) so they do not hammer
/// the bus in lockstep.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Returns the next delay and advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let upper = exp.as_millis().max(1) as u64;
        let lower = upper / 2;
        Duration::from_millis(rand::thread_rng().gen_range(lower..=upper))
    }

    /// Resets after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts taken since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
