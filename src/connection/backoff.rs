use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Capped exponential backoff with jitter for reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = u64::from(self.config.factor.max(1));
        let mut delay_ms = self.config.initial_delay_ms;
        for _ in 0..self.attempts {
            delay_ms = delay_ms.saturating_mul(factor);
            if delay_ms >= self.config.max_delay_ms {
                break;
            }
        }
        Duration::from_millis(delay_ms.min(self.config.max_delay_ms))
    }

    /// Delay before the next attempt, then advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.base_delay().as_millis() as u64;
        self.attempts = self.attempts.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base_ms == 0 {
            return Duration::from_millis(base_ms);
        }

        let mut rng = rand::thread_rng();
        let deviation = (base_ms as f64 * jitter * rng.gen_range(0.0..1.0)) as u64;
        let delay_ms = if rng.gen_bool(0.5) {
            base_ms.saturating_sub(deviation)
        } else {
            base_ms.saturating_add(deviation)
        };
        Duration::from_millis(delay_ms.min(self.config.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            factor: 2,
            jitter: 0.0,
        }
    }

    #[test]
    fn delays_grow_then_cap() {
        let mut backoff = Backoff::new(no_jitter());
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jittered_delay_stays_in_range() {
        let mut backoff = Backoff::new(ReconnectConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            factor: 2,
            jitter: 0.5,
        });
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().as_millis() as u64;
            assert!((500..=1500).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(no_jitter());
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.base_delay(), Duration::from_millis(1000));
    }
}
