use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff between delivery attempts.
///
/// The delay after the `n`th failed attempt is `min(base * 2^(n-1), cap)`.
/// With a non-zero `jitter` factor a uniformly random share of up to
/// `jitter * delay` is subtracted, spreading out re-claims of messages that
/// failed together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    /// Creates a backoff without jitter.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.0,
        }
    }

    /// Sets the jitter factor, clamped to `0.0..=1.0`. NaN disables jitter.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// The un-jittered delay after `attempts` failed attempts (1-indexed).
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        1u32.checked_shl(attempts - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// The delay after `attempts` failed attempts with jitter applied.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempts);

        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = delay.mul_f64(self.jitter);
        delay.saturating_sub(spread.mul_f64(rng.gen_range(0.0..=1.0)))
    }
}
