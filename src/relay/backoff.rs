//! Reconnect backoff with bounded jitter.

use std::time::Duration;

use rand::Rng;

/// Largest jitter fraction accepted. Keeping it below 1 guarantees each
/// delay is larger than the previous one until the cap is reached.
pub const MAX_JITTER: f64 = 0.99;

/// Exponential backoff calculator.
///
/// The delay for attempt `n` (starting at 0) is
/// `min(base * 2^n * (1 + jitter * r), max)` with `r` drawn from `[0, 1)`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use gnostr_core::relay::ExponentialBackoff;
///
/// let mut backoff = ExponentialBackoff::new(
///     Duration::from_millis(100),
///     Duration::from_secs(1),
///     0.0,
/// );
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
/// assert_eq!(backoff.attempt(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Creates a new backoff sequence. `jitter` is clamped to `[0, MAX_JITTER]`.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, MAX_JITTER)
        } else {
            0.0
        };
        Self {
            base_delay: base_delay.max(Duration::from_millis(1)),
            max_delay: max_delay.max(base_delay),
            jitter,
            attempt: 0,
        }
    }

    /// Returns the next delay and advances the attempt counter.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponential = base_ms * 2f64.powi(self.attempt.min(62) as i32);
        let factor = 1.0 + self.jitter * rand::thread_rng().gen::<f64>();

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((exponential * factor).min(max_ms).floor() as u64)
    }

    /// Resets the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays generated since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound on any delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.2)
    }
}
