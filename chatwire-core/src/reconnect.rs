// ABOUTME: Attempt schedule for socket reconnection after a drop.
// ABOUTME: First attempt is immediate, later ones back off exponentially up to max_retries.

use crate::error::ChatError;
use std::time::Duration;

/// Backoff configuration for socket reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Wait before the second attempt
    pub initial_delay: Duration,
    /// Ceiling for any single wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: u32,
    /// Retries allowed after the immediate first attempt
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_retries: 5,
        }
    }
}

/// Hands out the wait before each reconnect attempt of one recovery run.
///
/// A run makes at most `max_retries + 1` attempts: one right away, then one
/// after each delay of the schedule.
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    attempts: u32,
    next_delay: Duration,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        let next_delay = config.initial_delay;
        Self {
            config,
            attempts: 0,
            next_delay,
        }
    }

    /// Claim the next attempt, returning how long to wait before making it.
    /// `None` once the run is out of attempts.
    pub fn next_attempt(&mut self) -> Option<Duration> {
        if self.attempts > self.config.max_retries {
            return None;
        }

        let delay = if self.attempts == 0 {
            Duration::ZERO
        } else {
            let delay = self.next_delay;
            self.next_delay = std::cmp::min(
                self.next_delay.saturating_mul(self.config.multiplier),
                self.config.max_delay,
            );
            delay
        };
        self.attempts += 1;
        Some(delay)
    }

    /// Attempts claimed so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Error ending a run that used up its attempts
    pub fn exhausted(&self) -> ChatError {
        ChatError::ReconnectionExhausted {
            attempts: self.attempts,
        }
    }
}
