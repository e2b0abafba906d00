//! Backoff functions mapping a retry index to a wait duration
//!
//! Retry index `0` is the wait before the second attempt, `1` the wait
//! before the third, and so on.

use std::time::Duration;

use rand::Rng;

/// Backoff strategy for calculating retry delays
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff: `initial_delay * multiplier^retry`, capped at
    /// `max_delay`
    Exponential { initial_delay: Duration, multiplier: f64, max_delay: Duration },
}

impl BackoffStrategy {
    /// Calculate the un-jittered delay for the given retry index
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { initial_delay, multiplier, max_delay } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
                    *max_delay
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

/// Jitter type for adding randomness to retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter
    None,
    /// Full jitter: uniformly random between zero and the calculated delay
    Full,
}

impl Jitter {
    /// Apply jitter to the calculated delay
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Full => {
                if delay.is_zero() {
                    return delay;
                }
                let factor: f64 = rand::thread_rng().gen_range(0.0..=1.0);
                delay.mul_f64(factor)
            }
        }
    }
}

/// A complete backoff function: strategy plus jitter
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub jitter: Jitter,
}

impl Backoff {
    /// Constant wait between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self { strategy: BackoffStrategy::Fixed(delay), jitter: Jitter::None }
    }

    /// No wait between attempts
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Exponential wait without jitter
    pub fn exponential(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential { initial_delay, multiplier, max_delay },
            jitter: Jitter::None,
        }
    }

    /// Exponential wait with full jitter
    pub fn exponential_random(
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self { jitter: Jitter::Full, ..Self::exponential(initial_delay, multiplier, max_delay) }
    }

    /// Wait before the attempt following retry index `retry`
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.jitter.apply(self.strategy.calculate_delay(retry))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(50))
    }
}
