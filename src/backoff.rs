//! # Backoff
//! Exponential delay used by the supervisor between restarts and by the
//! scheduler after cycles that produced no usable data.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`. It is
//! derived purely from the attempt number, so the sequence is monotonically
//! non-decreasing for `factor >= 1.0`.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// Delay for attempt 0.
    pub first: Duration,
    /// Upper bound for any attempt.
    pub max: Duration,
    /// Growth factor per attempt.
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Delay for the given attempt (0-indexed), clamped to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
