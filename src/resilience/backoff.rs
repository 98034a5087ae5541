//! Exponential backoff with jitter.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::RestartConfig;

/// Calculate an exponential delay with up to 10% jitter.
///
/// `attempt` counts from 1; attempt 0 means no delay.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64, multiplier: f64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = multiplier.max(1.0).powi(attempt.saturating_sub(1).min(64) as i32);
    let delay_ms = (base_ms as f64 * factor).min(max_ms as f64) as u64;

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms + jitter)
}

/// Restart delay tracker for one backend.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    config: RestartConfig,
    /// Consecutive restarts since the last reset.
    attempt: u32,
}

impl RestartBackoff {
    pub fn new(config: RestartConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next restart; each call grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        calculate_backoff(
            self.attempt,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
            self.config.multiplier,
        )
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        if self.attempt > 0 {
            tracing::debug!(attempts = self.attempt, "Restart backoff reset");
        }
        self.attempt = 0;
    }

    /// Reset if the backend has been healthy since `since` for long enough.
    pub fn record_healthy(&mut self, since: Instant, now: Instant) {
        let healthy_for = now.saturating_duration_since(since);
        if healthy_for >= Duration::from_secs(self.config.healthy_reset_secs) {
            self.reset();
        }
    }

    /// Apply new parameters, keeping the attempt count.
    pub fn reconfigure(&mut self, config: RestartConfig) {
        self.config = config;
    }
}
