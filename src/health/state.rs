//! Latest health probe outcome.
//!
//! # Design Decisions
//! - Owned by the monitor, published read-only through a `watch` channel
//! - Consecutive failures reset on success and on every new backend pid,
//!   so a fresh process never inherits the previous one's failures

use std::time::SystemTime;

use serde::Serialize;

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ok,
    Fail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthStatus {
    pub last_result: Option<ProbeOutcome>,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<SystemTime>,
    pub last_error: Option<String>,
    /// Whether the public listener accepted a connection on the last check.
    pub router_reachable: Option<bool>,
}

impl HealthStatus {
    pub fn record_success(&mut self, at: SystemTime) {
        if self.consecutive_failures > 0 {
            tracing::info!(after_failures = self.consecutive_failures, "Backend probe recovered");
        }
        self.last_result = Some(ProbeOutcome::Ok);
        self.consecutive_failures = 0;
        self.last_checked_at = Some(at);
        self.last_error = None;
    }

    /// Record a failure; returns the consecutive failure count.
    pub fn record_failure(&mut self, error: String, at: SystemTime) -> u32 {
        self.last_result = Some(ProbeOutcome::Fail);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_checked_at = Some(at);
        self.last_error = Some(error);
        self.consecutive_failures
    }

    /// Forget failures of a previous backend process.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_result = None;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_until_success() {
        let mut status = HealthStatus::default();
        let now = SystemTime::now();
        assert_eq!(status.record_failure("timeout".into(), now), 1);
        assert_eq!(status.record_failure("refused".into(), now), 2);
        assert_eq!(status.last_error.as_deref(), Some("refused"));

        status.record_success(now);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_result, Some(ProbeOutcome::Ok));
        assert_eq!(status.record_failure("timeout".into(), now), 1);
    }
}
