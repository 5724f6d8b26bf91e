//! Capped exponential backoff for failed passes and listener restarts.

use std::time::Duration;

/// Tracks consecutive failures and the delay before the next attempt.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    base: Duration,
    current: Duration,
    max: Duration,
    failures: u32,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.min(max);
        Self {
            base,
            current: base,
            max,
            failures: 0,
        }
    }

    /// Record a failure and return the delay to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        let delay = self.current;
        self.failures += 1;
        // Double the interval up to max.
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// A success resets the delay to its base.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let delays: Vec<_> = (0..5).map(|_| backoff.fail()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert_eq!(backoff.failures(), 5);
    }

    #[test]
    fn reset_restores_base() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.fail();
        backoff.fail();
        backoff.reset();
        assert_eq!(backoff.fail(), Duration::from_secs(1));
    }
}
