//! Reconnect backoff policy
//!
//! Delays grow exponentially from `initial_delay` and are capped at `max_delay`.
//! A random jitter of up to 10% of the capped delay is added on top so that a
//! fleet of consumers does not reconnect in lockstep after a broker restart.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use crate::error::ConsumerError;

/// Upper bound of the additive jitter, as a fraction of the capped delay
pub const JITTER_RATIO: f64 = 0.1;

/// Backoff parameters shared by initial connect and reconnect
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Attempts allowed during `start()`; reconnects ignore this bound
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 10,
        }
    }
}

/// Partial override of [`BackoffConfig`], merged field by field over the defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackoffOverride {
    pub initial_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub multiplier: Option<f64>,
    pub max_retries: Option<u32>,
}

impl BackoffOverride {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

impl BackoffConfig {
    /// Apply an override on top of this configuration
    pub fn merge(self, overrides: BackoffOverride) -> Self {
        Self {
            initial_delay: overrides.initial_delay.unwrap_or(self.initial_delay),
            max_delay: overrides.max_delay.unwrap_or(self.max_delay),
            multiplier: overrides.multiplier.unwrap_or(self.multiplier),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
        }
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.initial_delay.is_zero() {
            return Err(ConsumerError::config("backoff initial_delay must be positive"));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConsumerError::config(
                "backoff max_delay must not be smaller than initial_delay",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(ConsumerError::config("backoff multiplier must be greater than 1"));
        }
        if self.max_retries == 0 {
            return Err(ConsumerError::config("backoff max_retries must be at least 1"));
        }
        Ok(())
    }

    /// Capped exponential delay for `attempt`, before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = initial * self.multiplier.powi(exponent);

        if raw.is_finite() && raw < max {
            Duration::from_secs_f64(raw)
        } else {
            self.max_delay
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based)
    pub fn next_delay(&self, attempt: u32, jitter: &mut dyn JitterSource) -> Duration {
        let base = self.base_delay(attempt);
        let sample = jitter.sample().clamp(0.0, 1.0);
        base + base.mul_f64(JITTER_RATIO * sample)
    }

    /// Delay before reconnect attempt `attempt` after a connection loss
    ///
    /// The first reconnect waits exactly `initial_delay`; later ones follow
    /// [`next_delay`](Self::next_delay) for the previous attempt.
    pub fn reconnect_delay(&self, attempt: u32, jitter: &mut dyn JitterSource) -> Duration {
        match attempt {
            0 => self.initial_delay,
            n => self.next_delay(n - 1, jitter),
        }
    }
}

/// Source of jitter samples in `[0, 1]`
pub trait JitterSource: Send {
    fn sample(&mut self) -> f64;
}

/// Jitter from the thread-local RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&mut self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Reproducible jitter for tests
#[derive(Debug, Clone)]
pub struct SeededJitter(StdRng);

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl JitterSource for SeededJitter {
    fn sample(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Always returns the same sample
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&mut self) -> f64 {
        self.0
    }
}
