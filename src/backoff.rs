//! Exponential backoff with jitter for failed blocking queries.

use std::time::Duration;

use rand::Rng;

/// Smallest delay between two failed queries.
pub(crate) const MIN_DELAY: Duration = Duration::from_millis(10);

/// Exponential backoff state.
///
/// Each call to [`Backoff::next_delay`] grows the delay by `factor`, capped at
/// `max`. With jitter enabled the delay is drawn between the previous delay and
/// the exponential bound, so consecutive delays never shrink until [`reset`].
///
/// [`reset`]: Backoff::reset
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    factor: f64,
    jitter: bool,
    min: Duration,
    max: Duration,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            factor: 2.0,
            jitter: true,
            min,
            max: max.max(min),
            attempt: 0,
            current: Duration::ZERO,
        }
    }

    #[cfg(test)]
    pub(crate) fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the delay before the next attempt and advances the state.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let upper = self.bound();
        let lower = self.current.max(self.min).min(upper);

        let delay = if self.jitter && lower < upper {
            rand::thread_rng().gen_range(lower..=upper)
        } else {
            upper
        };

        self.current = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forgets previous failures.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.current = Duration::ZERO;
    }

    fn bound(&self) -> Duration {
        let exp = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let secs = self.min.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs).max(self.min)
        }
    }
}
