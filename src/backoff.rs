//! Retry pacing for reconnect and bootstrap loops.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Fixed delay staircase used by reconnect loops: fast first retries,
/// then settling at one attempt per minute.
const STAIRCASE: [Duration; 11] = [
    Duration::from_millis(0),
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
    Duration::from_millis(5000),
    Duration::from_millis(10_000),
    Duration::from_millis(15_000),
    Duration::from_millis(30_000),
    Duration::from_millis(60_000),
];

#[derive(Debug, Clone)]
enum Mode {
    Staircase,
    Exponential { base: Duration, max: Duration },
}

/// Stateful delay sequence: each [`DelayIterator::delay`] sleeps for the
/// next step and advances, [`DelayIterator::reset`] restarts from zero.
#[derive(Debug, Clone)]
pub struct DelayIterator {
    index: u32,
    mode: Mode,
}

impl DelayIterator {
    /// Staircase mode, capped at the last step.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: 0,
            mode: Mode::Staircase,
        }
    }

    /// Exponential mode: `base * 2^n` capped at `max`, with ±25% jitter
    /// applied when sleeping.
    #[must_use]
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            index: 0,
            mode: Mode::Exponential { base, max },
        }
    }

    /// Restart the sequence from the first step.
    pub fn reset(&mut self) {
        self.index = 0;
    }

    /// The next delay, without jitter or side effects.
    #[must_use]
    pub fn peek(&self) -> Duration {
        match &self.mode {
            Mode::Staircase => {
                let idx = (self.index as usize).min(STAIRCASE.len() - 1);
                STAIRCASE[idx]
            }
            Mode::Exponential { base, max } => {
                let exp = base.saturating_mul(2u32.saturating_pow(self.index));
                exp.min(*max)
            }
        }
    }

    /// Advance to the next step, returning the delay to sleep (jittered in
    /// exponential mode).
    pub fn advance(&mut self) -> Duration {
        let delay = self.peek();
        self.index = self.index.saturating_add(1);
        match self.mode {
            Mode::Staircase => delay,
            Mode::Exponential { .. } => jitter(delay),
        }
    }

    /// Sleep for the next step of the sequence.
    pub async fn delay(&mut self) {
        let delay = self.advance();
        if !delay.is_zero() {
            debug!("delaying next attempt for {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for DelayIterator {
    fn default() -> Self {
        Self::new()
    }
}

/// Spread a delay by ±25% so parallel retry loops do not align.
fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staircase_follows_list_and_caps() {
        let mut d = DelayIterator::new();
        let mut seen = Vec::new();
        for _ in 0..STAIRCASE.len() + 3 {
            seen.push(d.peek());
            d.advance();
        }
        assert_eq!(&seen[..STAIRCASE.len()], &STAIRCASE[..]);
        // Past the end the last step repeats.
        assert!(seen[STAIRCASE.len()..]
            .iter()
            .all(|&s| s == Duration::from_secs(60)));
    }

    #[test]
    fn reset_restarts_from_zero() {
        let mut d = DelayIterator::new();
        d.advance();
        d.advance();
        assert_ne!(d.peek(), Duration::ZERO);
        d.reset();
        assert_eq!(d.peek(), Duration::ZERO);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let mut d = DelayIterator::exponential(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(d.peek(), Duration::from_secs(1));
        d.advance();
        assert_eq!(d.peek(), Duration::from_secs(2));
        d.advance();
        assert_eq!(d.peek(), Duration::from_secs(4));
        d.advance();
        assert_eq!(d.peek(), Duration::from_secs(8));
        d.advance();
        assert_eq!(d.peek(), Duration::from_secs(10));
        d.advance();
        assert_eq!(d.peek(), Duration::from_secs(10));
    }

    #[test]
    fn exponential_jitter_stays_within_quarter() {
        let mut d = DelayIterator::exponential(Duration::from_secs(4), Duration::from_secs(60));
        for _ in 0..50 {
            let expected = d.peek();
            let jittered = d.advance();
            assert!(jittered >= expected.mul_f64(0.75));
            assert!(jittered <= expected.mul_f64(1.25));
            d.reset();
        }
    }
}
