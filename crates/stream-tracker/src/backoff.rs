//! Reconnection backoff for the polling tracker (§4.5 "Reconnection
//! backoff"): a capped geometric sequence that advances on each consecutive
//! tick failure and resets to the base delay after a successful tick.
//!
//! Shaped like `twitch_api::rate_limit::Backoff429` (an iterator value
//! rather than a re-derived formula at each call site), but resettable
//! since the polling loop needs to fall back to `base` as soon as a tick
//! succeeds again.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    step: u32,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, step: u32, max: Duration) -> Self {
        Self {
            base,
            step,
            max,
            current: base,
        }
    }

    /// The delay to wait for the current failure streak, advancing the
    /// internal cursor for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * self.step).min(self.max);
        delay
    }

    /// Resets the cursor to `base` after a successful tick.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for ReconnectBackoff {
    /// Base 1s, doubling, capped at 5 minutes — generous enough that a
    /// flaky API doesn't spin the tracker, bounded enough that it recovers
    /// quickly once reachable again.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2, Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), 2, Duration::from_secs(8));
        let got: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(got, vec![1, 2, 4, 8, 8]);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), 2, Duration::from_secs(8));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay().as_secs(), 1);
    }
}
