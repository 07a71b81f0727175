//! Exponential reconnection backoff.

use std::time::Duration;

/// First retry delay after a failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Ceiling for the retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(8000);

/// Doubling retry delay, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::with_limits(INITIAL_BACKOFF, MAX_BACKOFF)
    }

    pub fn with_limits(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Delay the next call to `next_delay` would return.
    pub fn peek(&self) -> Duration {
        self.next
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(d: Duration) -> u64 {
        d.as_millis() as u64
    }

    #[test]
    fn doubles_from_250() {
        let mut b = Backoff::new();
        let delays: Vec<u64> = (0..4).map(|_| ms(b.next_delay())).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000]);
    }

    #[test]
    fn caps_at_8000() {
        let mut b = Backoff::new();
        let delays: Vec<u64> = (0..8).map(|_| ms(b.next_delay())).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn reset_after_success() {
        let mut b = Backoff::new();
        for _ in 0..4 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(ms(b.next_delay()), 250);
    }
}
