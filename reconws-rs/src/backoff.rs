//! Exponential backoff between reconnect attempts

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with optional jitter, clamped to `[min, max]`
///
/// Each call to [`Backoff::duration`] returns `min * factor^attempt` and
/// advances the attempt counter. [`Backoff::reset`] is called after a
/// successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    retry: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry, attempt: 0 }
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt, then advance
    pub fn duration(&mut self) -> Duration {
        let delay = self.for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay for a given attempt number without advancing
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        let min = self.retry.min.as_secs_f64();
        let max = self.retry.max.as_secs_f64().max(min);
        let factor = if self.retry.factor.is_finite() && self.retry.factor >= 1.0 {
            self.retry.factor
        } else {
            1.0
        };

        let exponent = attempt.min(i32::MAX as u32) as i32;
        let mut secs = min * factor.powi(exponent);
        if !secs.is_finite() || secs > max {
            secs = max;
        }

        if self.retry.jitter && secs > min {
            secs = rand::thread_rng().gen_range(min..=secs);
        }

        Duration::from_secs_f64(secs.clamp(min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(min_ms: u64, max_ms: u64, factor: f64, jitter: bool) -> RetryConfig {
        RetryConfig::default()
            .bounds(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
            .factor(factor)
            .jitter(jitter)
    }

    #[test]
    fn test_backoff_grows_by_factor() {
        let mut backoff = Backoff::new(retry(100, 10_000, 2.0, false));

        assert_eq!(backoff.duration(), Duration::from_millis(100));
        assert_eq!(backoff.duration(), Duration::from_millis(200));
        assert_eq!(backoff.duration(), Duration::from_millis(400));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_backoff_clamped_to_max() {
        let backoff = Backoff::new(retry(100, 1_000, 2.0, false));

        assert_eq!(backoff.for_attempt(10), Duration::from_millis(1_000));
        assert_eq!(backoff.for_attempt(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(retry(50, 1_000, 3.0, false));
        backoff.duration();
        backoff.duration();
        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let backoff = Backoff::new(retry(100, 2_000, 2.0, true));

        for attempt in 0..20 {
            let delay = backoff.for_attempt(attempt);
            assert!(delay >= Duration::from_millis(100), "{:?} below min", delay);
            assert!(delay <= Duration::from_millis(2_000), "{:?} above max", delay);
        }
    }

    #[test]
    fn test_backoff_factor_below_one_is_constant() {
        let backoff = Backoff::new(retry(250, 5_000, 0.5, false));

        assert_eq!(backoff.for_attempt(0), Duration::from_millis(250));
        assert_eq!(backoff.for_attempt(5), Duration::from_millis(250));
    }

    #[test]
    fn test_backoff_max_below_min_uses_min() {
        let backoff = Backoff::new(retry(500, 100, 2.0, false));
        assert_eq!(backoff.for_attempt(3), Duration::from_millis(500));
    }
}
