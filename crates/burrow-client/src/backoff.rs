//! Exponential backoff between connection attempts

use std::time::Duration;
use tracing::debug;

/// Delay before the first retry
pub const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Backoff multiplier
pub const BACKOFF_FACTOR: f64 = 2.0;

/// Exponential backoff state owned by the reconnection loop.
///
/// `duration()` returns the delay for the current attempt and then advances
/// the attempt counter. Delays grow from [`MIN_BACKOFF`] by [`BACKOFF_FACTOR`]
/// and never exceed `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self {
            min: MIN_BACKOFF,
            max,
            factor: BACKOFF_FACTOR,
            attempt: 0,
        }
    }

    /// Delay for the current attempt; advances the attempt counter
    pub fn duration(&mut self) -> Duration {
        let d = self.for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        d
    }

    /// Delay for a given attempt number without touching the counter
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        if self.min >= self.max {
            return self.max;
        }
        let exp = attempt.min(64) as i32;
        let secs = self.min.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.attempt = 0;
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
