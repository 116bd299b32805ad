use rand::Rng;
use std::time::Duration;

/// Delay schedule between draw attempts that lost a lock race.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^(retry-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::Exponential { base, max } => {
                let shift = retry.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// Bounded retry budget for lock contention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (never less than 1).
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Apply "equal jitter" to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::Fixed(Duration::from_millis(50)),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry`. With jitter the delay is drawn
    /// uniformly from `[delay / 2, delay]`.
    pub fn delay(&self, rng: &mut impl Rng, retry: u32) -> Duration {
        let delay = self.backoff.delay(retry);
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if !self.jitter || millis < 2 {
            return delay;
        }
        Duration::from_millis(rng.gen_range(millis / 2..=millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn exponential_doubles_until_cap() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(10),
            max: Duration::from_millis(35),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(35));
        assert_eq!(policy.delay(40), Duration::from_millis(35));
    }

    #[test]
    fn jitter_stays_within_half_and_full() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy::Fixed(Duration::from_millis(100)),
            jitter: true,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 1..=100 {
            let delay = policy.delay(&mut rng, retry);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.attempts(), 1);
    }
}
