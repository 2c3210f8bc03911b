//! Jittered exponential backoff for the reconnect loop.

use std::time::Duration;

use rand::Rng as _;

/// Exponential backoff with ±25% jitter and an upper cap.
///
/// Delays double per attempt starting from the base; [`ReconnectBackoff::reset`]
/// is called after a successful authentication so a flapping link does not
/// inherit the previous outage's delay.
pub(crate) struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The next delay: `base * 2^attempt`, jittered, never above the cap.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        exp.mul_f64(jitter).min(self.cap)
    }

    /// Back to the base delay.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
