//! Backoff schedules.
//!
//! The worker pool uses one for the pause before a requeued job is
//! republished and another for local retries of store and broker calls.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    Fixed,
    /// `base * 2^(attempt-1)`
    #[default]
    Exponential,
    /// `base * attempt`
    Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap for growing strategies
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Spread around the nominal delay, as a fraction (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Short, bounded retries for store and broker calls inside a worker.
    pub fn local_io() -> Self {
        Self::exponential(5, Duration::from_millis(100), Duration::from_secs(5))
    }

    /// Delay before retry number `attempt` (1-based; 0 means no delay).
    ///
    /// Jitter is derived from the attempt number, so a schedule is reproducible.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let cap = self.max_delay.max(self.base_delay);
        let nominal = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32 << (attempt - 1).min(30);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt).min(self.max_delay),
        };

        let spread = nominal.mul_f64(self.jitter.clamp(0.0, 1.0));
        if spread.is_zero() {
            return nominal.min(cap);
        }
        // Offset in [-1.0, 1.0)
        let offset = f64::from(attempt.wrapping_mul(17) % 100) / 50.0 - 1.0;
        let delay = if offset < 0.0 {
            nominal.saturating_sub(spread.mul_f64(-offset))
        } else {
            nominal.saturating_add(spread.mul_f64(offset))
        };
        delay.min(cap)
    }

    /// Whether another try is allowed after `tries` tries.
    pub fn should_retry(&self, tries: u32) -> bool {
        tries < self.max_attempts
    }
}
