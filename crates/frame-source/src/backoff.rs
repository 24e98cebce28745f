//! Reconnect backoff
//!
//! Exponential backoff with full jitter: each delay is drawn uniformly from
//! zero to the current exponential ceiling, so a fleet of reconnecting
//! cameras does not thundering-herd the NVR.

use rand::Rng;
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First ceiling (default 500 ms)
    pub initial: Duration,
    /// Ceiling cap (default 30 s)
    pub max: Duration,
    /// Total time allowed across attempts before giving up (None = forever)
    pub deadline: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

/// Backoff state for one connection.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    elapsed: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Next delay to sleep before retrying, or None once the deadline is
    /// spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let ceiling = self.current_ceiling();
        let delay = Duration::from_millis(rand::rng().random_range(0..=ceiling.as_millis() as u64));

        if let Some(deadline) = self.config.deadline {
            if self.elapsed + delay > deadline {
                return None;
            }
        }
        self.elapsed += delay;
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.elapsed = Duration::ZERO;
    }

    fn current_ceiling(&self) -> Duration {
        let doubled = self
            .config
            .initial
            .saturating_mul(1u32 << self.attempt.min(16));
        doubled.min(self.config.max)
    }
}
