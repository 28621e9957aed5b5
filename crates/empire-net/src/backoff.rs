//! Exponential backoff between reconnect attempts.
//!
//! [`Backoff`] starts at the configured floor, multiplies the delay after
//! every scheduled attempt and clamps it at the ceiling. It never gives up:
//! the controller keeps retrying until it is told to stop, and
//! [`Backoff::reset`] brings the delay back to the floor once a session is
//! live again.

use std::time::Duration;

use rand::Rng;

/// Configuration for client-side reconnection behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each attempt. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Maximum delay between attempts. Default: 30 s.
    pub max_delay: Duration,
    /// Jitter factor (0.0–1.0), applied as ±jitter to the delay. Default: 0.0.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

/// Tracks attempt count and computes the next retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl Backoff {
    /// Create a new backoff at the floor.
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_delay;
        self.attempts = self.attempts.saturating_add(1);

        // Uniform in [base * (1 - jitter), base * (1 + jitter)]
        let jittered = if self.config.jitter > 0.0 {
            let jitter = self.config.jitter.min(1.0);
            let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self
            .current_delay
            .mul_f64(self.config.backoff_multiplier.max(1.0));
        self.current_delay = next.min(self.config.max_delay);

        jittered.min(self.config.max_delay)
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) would start from, before jitter.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Return to the floor. Called once a session is live.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
