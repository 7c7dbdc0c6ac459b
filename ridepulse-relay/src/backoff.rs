//! Exponential reconnect backoff with jitter.
//!
//! Attempt `n` waits `min(unit * 2^n, max)` scaled by a factor drawn
//! uniformly from [0.8, 1.2], so a fleet of clients dropped by the same
//! outage does not retry in lockstep.

use rand::Rng;
use std::time::Duration;

pub const JITTER_MIN: f64 = 0.8;
pub const JITTER_MAX: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    unit: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(unit: Duration, max: Duration) -> Self {
        Self { unit, max }
    }

    /// Delay for `attempt` before jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        // 2^31 units already overflows any sane ceiling.
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.unit
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay for `attempt` scaled by an explicit jitter factor.
    pub fn with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        self.base(attempt)
            .mul_f64(jitter.clamp(JITTER_MIN, JITTER_MAX))
    }

    /// Delay for `attempt` with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.with_jitter(attempt, jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_sequence_is_capped() {
        let backoff = Backoff::default();
        let secs: Vec<u64> = (1..=6).map(|n| backoff.base(n).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = Backoff::default();
        for attempt in 1..=6 {
            let base = backoff.base(attempt);
            for _ in 0..50 {
                let delay = backoff.delay(attempt);
                assert!(delay >= base.mul_f64(JITTER_MIN), "{delay:?} < 0.8 x {base:?}");
                assert!(delay <= base.mul_f64(JITTER_MAX), "{delay:?} > 1.2 x {base:?}");
            }
        }
    }

    #[test]
    fn test_explicit_jitter_is_clamped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.with_jitter(1, 1.0), Duration::from_secs(2));
        assert_eq!(backoff.with_jitter(1, 5.0), Duration::from_secs(2).mul_f64(1.2));
        assert_eq!(backoff.with_jitter(1, 0.0), Duration::from_secs(2).mul_f64(0.8));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base(u32::MAX), Duration::from_secs(30));
        assert_eq!(backoff.base(0), Duration::from_secs(1));
    }

    #[test]
    fn test_custom_unit() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(backoff.base(1), Duration::from_millis(20));
        assert_eq!(backoff.base(3), Duration::from_millis(50));
    }
}
