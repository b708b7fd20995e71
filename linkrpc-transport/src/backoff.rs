use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Chooses how long to wait before reconnect attempt `attempt` (0-based).
pub trait RetryDelay: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;

    /// Give up after this many consecutive failed attempts.
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}

/// Doubling delay starting at `initial` and capped at `max`, plus up to
/// `jitter` (fraction of the base delay) of random spread. Even the first
/// attempt waits, so clients dropped together do not reconnect together.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: f64,
    pub max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialBackoff {
            initial,
            max,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.25,
            max_attempts: None,
        }
    }
}

impl RetryDelay for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let extra = rand::rng().random_range(0.0..=spread);
        base + Duration::from_secs_f64(extra)
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Same delay for every attempt.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        FixedDelay {
            delay,
            max_attempts: None,
        }
    }
}

impl RetryDelay for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}
