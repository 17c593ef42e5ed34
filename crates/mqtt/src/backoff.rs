//! Exponential backoff used between connection attempts.
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With `reconnect_delay = 1`, `reconnect_backoff_delimiter = 2` and
//! `max_reconnect_delay = 60` the sequence is 1s, 2s, 4s, ... 32s, 60s, 60s.
//! An attempt limit of `None` retries forever.

use std::time::Duration;

use thiserror::Error;

use super::config::Config;

#[derive(Debug, Error)]
pub enum BackoffError {
    /// Every allowed attempt has been used; carries the limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Delay schedule for reconnect attempts. Not shared: each connection loop
/// owns one and calls [`Backoff::reset`] once connected.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay, restored by `reset`.
    initial_delay: Duration,
    /// Delay handed out by the next `next_sleep`.
    current_delay: Duration,
    /// Ceiling for the delay.
    max_delay: Duration,
    /// Growth factor per attempt, at least 1.0.
    multiplier: f64,
    /// Attempts made since the last reset.
    attempt: u32,
    /// `None` retries forever.
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Unlimited backoff. Multipliers below 1.0 are clamped to 1.0 so the
    /// delay never shrinks.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial.min(max),
            max_delay: max,
            multiplier: multiplier.max(1.0),
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Builds the reconnect policy described by a transport config.
    ///
    /// `max_reconnect_attempts = 0` means unlimited.
    pub fn from_config(config: &Config) -> Self {
        let backoff = Self::new(
            Duration::from_secs(config.reconnect_delay),
            Duration::from_secs(config.max_reconnect_delay.max(config.reconnect_delay)),
            config.reconnect_backoff_delimiter as f64,
        );
        match config.max_reconnect_attempts {
            0 => backoff,
            n => backoff.with_max_attempts(u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }

    /// Caps the number of `next_sleep` calls that succeed.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Starts the schedule over after a successful connection.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay.min(self.max_delay);
        self.attempt = 0;
    }

    /// Returns how long to sleep before the next attempt, or an error once the
    /// attempt limit is spent.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }
        self.attempt += 1;

        let sleep = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        Ok(sleep)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}
