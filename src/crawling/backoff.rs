//! Bounded exponential backoff for throttled requests.

use std::time::Duration;

/// Doubles the delay after every consecutive throttle, up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Upper bound of the random extra added to each delay
    jitter: Duration,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: Duration::ZERO,
            attempt: 0,
        }
    }

    /// Spreads out workers that were throttled at the same moment
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next request.
    ///
    /// A server supplied `retry_after` raises the delay but never beyond `max`.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        let factor = 2_u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);

        let exponential = self.base.saturating_mul(factor);
        let jittered = exponential.saturating_add(self.next_jitter()).min(self.max);
        retry_after.map_or(jittered, |hint| jittered.max(hint.min(self.max)))
    }

    fn next_jitter(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        }
    }

    /// Called after a successful request
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}
