//! Backend lifecycle state machine.
//!
//! # States
//! - Starting: socket bound, process about to be spawned
//! - Listening: process spawned, not yet answering probes
//! - Healthy: probes succeed
//! - Unhealthy: `unhealthy_threshold` consecutive probe failures
//! - Crashed: process exited unexpectedly or was killed for failing probes
//! - Stopped: terminal, after shutdown or an intentional clean exit
//!
//! # State Transitions
//! ```text
//! Starting  → Listening : process spawned
//! Starting  → Crashed   : spawn failed
//! Listening → Healthy   : first successful probe
//! Healthy   → Unhealthy : consecutive failures reach unhealthy_threshold
//! Unhealthy → Healthy   : a successful probe
//! Unhealthy → Crashed   : consecutive failures reach failure_ceiling
//! any live  → Crashed   : process exits non-zero or by signal
//! Crashed   → Starting  : backoff delay elapsed
//! any       → Stopped   : shutdown, once the process has exited
//! ```
//!
//! # Design Decisions
//! - Pure: `apply` maps (state, event, now) to a directive; the supervisor
//!   actor performs the I/O. Every transition is testable without processes
//! - Threshold crossings are edge-triggered, so repeated failures past the
//!   threshold never re-trigger a transition

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{HealthCheckConfig, RestartConfig};
use crate::resilience::RestartBackoff;
use crate::supervisor::process::ExitKind;

/// Backend process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Starting,
    Listening,
    Healthy,
    Unhealthy,
    Crashed,
    Stopped,
}

impl BackendState {
    pub const ALL: [BackendState; 6] = [
        BackendState::Starting,
        BackendState::Listening,
        BackendState::Healthy,
        BackendState::Unhealthy,
        BackendState::Crashed,
        BackendState::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Starting => "starting",
            BackendState::Listening => "listening",
            BackendState::Healthy => "healthy",
            BackendState::Unhealthy => "unhealthy",
            BackendState::Crashed => "crashed",
            BackendState::Stopped => "stopped",
        }
    }

    /// States in which a backend process may be answering.
    pub fn is_probeable(&self) -> bool {
        matches!(
            self,
            BackendState::Listening | BackendState::Healthy | BackendState::Unhealthy
        )
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Spawned { pid: u32 },
    SpawnFailed,
    /// Health results name the process they were taken against.
    ProbeSucceeded { pid: u32 },
    /// `consecutive` counts failures since the last success.
    ProbeFailed { pid: u32, consecutive: u32 },
    Exited(ExitKind),
    /// Operator restart: stop the current process, start a new one at once.
    RestartRequested,
    /// The backoff delay scheduled by `ScheduleRestart` has elapsed.
    RestartDue,
    ShutdownRequested,
}

/// Actions the supervisor must carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Spawn,
    /// SIGTERM the process, SIGKILL its group after the grace period.
    Terminate,
    ScheduleRestart(Duration),
    /// Reached Stopped; the supervisor exits.
    Halt,
}

/// Thresholds that drive health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub unhealthy_threshold: u32,
    pub failure_ceiling: u32,
    pub restart_on_clean_exit: bool,
}

impl HealthPolicy {
    pub fn new(health: &HealthCheckConfig, restart_on_clean_exit: bool) -> Self {
        Self {
            unhealthy_threshold: health.unhealthy_threshold.max(1),
            failure_ceiling: health.failure_ceiling.max(health.unhealthy_threshold).max(1),
            restart_on_clean_exit,
        }
    }
}

/// The state machine for one backend process group.
#[derive(Debug)]
pub struct Lifecycle {
    state: BackendState,
    pid: Option<u32>,
    healthy_since: Option<Instant>,
    restart_count: u32,
    last_exit: Option<ExitKind>,
    /// Operator asked for a restart; spawn as soon as the process exits.
    restart_pending: bool,
    /// Shutdown requested; stop once the process exits.
    stopping: bool,
    policy: HealthPolicy,
    backoff: RestartBackoff,
}

impl Lifecycle {
    pub fn new(policy: HealthPolicy, restart: RestartConfig) -> Self {
        Self {
            state: BackendState::Starting,
            pid: None,
            healthy_since: None,
            restart_count: 0,
            last_exit: None,
            restart_pending: false,
            stopping: false,
            policy,
            backoff: RestartBackoff::new(restart),
        }
    }

    /// The first directive, issued once the socket is bound.
    pub fn start(&self) -> Directive {
        Directive::Spawn
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn last_exit(&self) -> Option<ExitKind> {
        self.last_exit
    }

    pub fn reconfigure(&mut self, policy: HealthPolicy, restart: RestartConfig) {
        self.policy = policy;
        self.backoff.reconfigure(restart);
    }

    fn transition(&mut self, next: BackendState, now: Instant) {
        if next == self.state {
            return;
        }
        tracing::info!(from = self.state.as_str(), to = next.as_str(), pid = ?self.pid, "Backend state changed");
        if next == BackendState::Healthy {
            self.healthy_since = Some(now);
        } else if self.state == BackendState::Healthy {
            self.backoff_credit(now);
            self.healthy_since = None;
        }
        self.state = next;
    }

    fn backoff_credit(&mut self, now: Instant) {
        if let Some(since) = self.healthy_since {
            self.backoff.record_healthy(since, now);
        }
    }

    fn crash(&mut self, now: Instant) -> Directive {
        self.transition(BackendState::Crashed, now);
        Directive::ScheduleRestart(self.backoff.next_delay())
    }

    fn restart_now(&mut self, now: Instant) -> Directive {
        self.restart_pending = false;
        self.restart_count += 1;
        self.transition(BackendState::Starting, now);
        Directive::Spawn
    }

    /// Feed one event. Returns what the supervisor must do next, if anything.
    pub fn apply(&mut self, event: Event, now: Instant) -> Option<Directive> {
        use BackendState::*;

        if self.state == Stopped {
            return None;
        }
        if let Event::ProbeSucceeded { pid } | Event::ProbeFailed { pid, .. } = event {
            if self.pid != Some(pid) {
                tracing::debug!(checked = pid, current = ?self.pid, "Ignoring health result for replaced process");
                return None;
            }
        }

        match event {
            Event::Spawned { pid } => {
                self.pid = Some(pid);
                self.transition(Listening, now);
                if self.stopping {
                    return Some(Directive::Terminate);
                }
                None
            }
            Event::SpawnFailed => {
                self.pid = None;
                if self.stopping {
                    self.transition(Stopped, now);
                    return Some(Directive::Halt);
                }
                Some(self.crash(now))
            }
            Event::ProbeSucceeded { .. } => {
                match self.state {
                    Listening | Unhealthy => self.transition(Healthy, now),
                    Healthy => self.backoff_credit(now),
                    _ => {}
                }
                None
            }
            Event::ProbeFailed { consecutive, .. } => match self.state {
                Healthy if consecutive >= self.policy.failure_ceiling => {
                    self.transition(Unhealthy, now);
                    self.transition(Crashed, now);
                    Some(Directive::Terminate)
                }
                Healthy if consecutive >= self.policy.unhealthy_threshold => {
                    self.transition(Unhealthy, now);
                    None
                }
                Listening | Unhealthy if consecutive >= self.policy.failure_ceiling => {
                    tracing::warn!(consecutive, pid = ?self.pid, "Probe failures reached ceiling, killing backend");
                    self.transition(Crashed, now);
                    Some(Directive::Terminate)
                }
                _ => None,
            },
            Event::Exited(kind) => {
                self.pid = None;
                self.last_exit = Some(kind);
                if self.stopping {
                    self.transition(Stopped, now);
                    return Some(Directive::Halt);
                }
                if self.restart_pending {
                    return Some(self.restart_now(now));
                }
                if self.state == Crashed {
                    // Killed for failing probes.
                    return Some(Directive::ScheduleRestart(self.backoff.next_delay()));
                }
                if kind.is_clean() && !self.policy.restart_on_clean_exit {
                    tracing::info!("Backend exited cleanly, not restarting");
                    self.transition(Stopped, now);
                    return Some(Directive::Halt);
                }
                tracing::warn!(exit = %kind, "Backend exited unexpectedly");
                if self.state == Healthy {
                    self.transition(Unhealthy, now);
                }
                Some(self.crash(now))
            }
            Event::RestartRequested => match self.state {
                Listening | Healthy | Unhealthy => {
                    self.restart_pending = true;
                    Some(Directive::Terminate)
                }
                Crashed if self.pid.is_some() => {
                    self.restart_pending = true;
                    None
                }
                Crashed => {
                    // Waiting on the backoff timer: skip it.
                    self.backoff.reset();
                    Some(self.restart_now(now))
                }
                Starting | Stopped => None,
            },
            Event::RestartDue => {
                if self.state == Crashed && self.pid.is_none() {
                    Some(self.restart_now(now))
                } else {
                    None
                }
            }
            Event::ShutdownRequested => {
                self.stopping = true;
                if self.pid.is_some() {
                    Some(Directive::Terminate)
                } else if self.state == Starting {
                    // Spawn in flight; terminate on Spawned or halt on SpawnFailed.
                    None
                } else {
                    self.transition(Stopped, now);
                    Some(Directive::Halt)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new(
            HealthPolicy {
                unhealthy_threshold: 3,
                failure_ceiling: 6,
                restart_on_clean_exit: false,
            },
            RestartConfig {
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                multiplier: 2.0,
                healthy_reset_secs: 60,
            },
        )
    }

    fn healthy(now: Instant) -> Lifecycle {
        let mut lc = lifecycle();
        lc.apply(Event::Spawned { pid: 10 }, now);
        lc.apply(Event::ProbeSucceeded { pid: 10 }, now);
        assert_eq!(lc.state(), BackendState::Healthy);
        lc
    }

    fn delay(directive: Option<Directive>) -> Duration {
        match directive {
            Some(Directive::ScheduleRestart(d)) => d,
            other => panic!("expected ScheduleRestart, got {other:?}"),
        }
    }

    #[test]
    fn cold_start_path() {
        let now = Instant::now();
        let mut lc = lifecycle();
        assert_eq!(lc.start(), Directive::Spawn);
        assert_eq!(lc.state(), BackendState::Starting);

        assert_eq!(lc.apply(Event::Spawned { pid: 42 }, now), None);
        assert_eq!(lc.state(), BackendState::Listening);
        assert_eq!(lc.pid(), Some(42));

        lc.apply(Event::ProbeFailed { pid: 42, consecutive: 1 }, now);
        assert_eq!(lc.state(), BackendState::Listening);

        lc.apply(Event::ProbeSucceeded { pid: 42 }, now);
        assert_eq!(lc.state(), BackendState::Healthy);
    }

    #[test]
    fn unhealthy_exactly_once_per_threshold_crossing() {
        let now = Instant::now();
        let mut lc = healthy(now);

        lc.apply(Event::ProbeFailed { pid: 10, consecutive: 1 }, now);
        lc.apply(Event::ProbeFailed { pid: 10, consecutive: 2 }, now);
        assert_eq!(lc.state(), BackendState::Healthy);

        lc.apply(Event::ProbeFailed { pid: 10, consecutive: 3 }, now);
        assert_eq!(lc.state(), BackendState::Unhealthy);
        assert_eq!(lc.apply(Event::ProbeFailed { pid: 10, consecutive: 4 }, now), None);
        assert_eq!(lc.state(), BackendState::Unhealthy);

        // One flaky probe after recovery does not flip the state.
        lc.apply(Event::ProbeSucceeded { pid: 10 }, now);
        assert_eq!(lc.state(), BackendState::Healthy);
        lc.apply(Event::ProbeFailed { pid: 10, consecutive: 1 }, now);
        assert_eq!(lc.state(), BackendState::Healthy);
    }

    #[test]
    fn ceiling_kills_then_restarts_with_backoff() {
        let now = Instant::now();
        let mut lc = healthy(now);
        for n in 3..6 {
            lc.apply(Event::ProbeFailed { pid: 10, consecutive: n }, now);
        }
        assert_eq!(
            lc.apply(Event::ProbeFailed { pid: 10, consecutive: 6 }, now),
            Some(Directive::Terminate)
        );
        assert_eq!(lc.state(), BackendState::Crashed);

        let d = delay(lc.apply(Event::Exited(ExitKind::Signaled(15)), now));
        assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(110));

        assert_eq!(lc.apply(Event::RestartDue, now), Some(Directive::Spawn));
        assert_eq!(lc.state(), BackendState::Starting);
        assert_eq!(lc.restart_count(), 1);
    }

    #[test]
    fn late_failures_for_a_replaced_process_are_ignored() {
        let now = Instant::now();
        let mut lc = healthy(now);
        delay(lc.apply(Event::Exited(ExitKind::Signaled(9)), now));
        lc.apply(Event::RestartDue, now);
        lc.apply(Event::Spawned { pid: 11 }, now);

        // A check started against pid 10 finishes after pid 11 is up.
        assert_eq!(lc.apply(Event::ProbeFailed { pid: 10, consecutive: 50 }, now), None);
        assert_eq!(lc.state(), BackendState::Listening);
        assert_eq!(lc.pid(), Some(11));
        assert_eq!(lc.apply(Event::ProbeSucceeded { pid: 10 }, now), None);
        assert_eq!(lc.state(), BackendState::Listening);

        assert_eq!(
            lc.apply(Event::ProbeFailed { pid: 11, consecutive: 6 }, now),
            Some(Directive::Terminate)
        );
    }

    #[test]
    fn abrupt_exit_crashes_and_backoff_grows() {
        let now = Instant::now();
        let mut lc = healthy(now);

        let first = delay(lc.apply(Event::Exited(ExitKind::Signaled(9)), now));
        assert_eq!(lc.state(), BackendState::Crashed);
        assert_eq!(lc.pid(), None);

        lc.apply(Event::RestartDue, now);
        lc.apply(Event::Spawned { pid: 11 }, now);
        let second = delay(lc.apply(Event::Exited(ExitKind::Failed(1)), now));
        assert!(second > first);
        assert_eq!(lc.last_exit(), Some(ExitKind::Failed(1)));
    }

    #[test]
    fn sustained_health_resets_backoff() {
        let now = Instant::now();
        let mut lc = healthy(now);
        delay(lc.apply(Event::Exited(ExitKind::Failed(1)), now));
        lc.apply(Event::RestartDue, now);
        lc.apply(Event::Spawned { pid: 11 }, now);
        lc.apply(Event::ProbeSucceeded { pid: 11 }, now);

        let later = now + Duration::from_secs(61);
        lc.apply(Event::ProbeSucceeded { pid: 11 }, later);
        let d = delay(lc.apply(Event::Exited(ExitKind::Failed(1)), later));
        assert!(d < Duration::from_millis(110));
    }

    #[test]
    fn clean_exit_stops_unless_configured() {
        let now = Instant::now();
        let mut lc = healthy(now);
        assert_eq!(
            lc.apply(Event::Exited(ExitKind::Clean), now),
            Some(Directive::Halt)
        );
        assert_eq!(lc.state(), BackendState::Stopped);
        assert_eq!(lc.apply(Event::RestartDue, now), None);

        let mut lc = lifecycle();
        lc.policy.restart_on_clean_exit = true;
        lc.apply(Event::Spawned { pid: 5 }, now);
        delay(lc.apply(Event::Exited(ExitKind::Clean), now));
        assert_eq!(lc.state(), BackendState::Crashed);
    }

    #[test]
    fn shutdown_terminates_then_stops() {
        let now = Instant::now();
        let mut lc = healthy(now);
        assert_eq!(lc.apply(Event::ShutdownRequested, now), Some(Directive::Terminate));
        assert_eq!(lc.state(), BackendState::Healthy);
        assert_eq!(
            lc.apply(Event::Exited(ExitKind::Failed(1)), now),
            Some(Directive::Halt)
        );
        assert_eq!(lc.state(), BackendState::Stopped);
    }

    #[test]
    fn shutdown_while_waiting_for_restart_halts() {
        let now = Instant::now();
        let mut lc = healthy(now);
        delay(lc.apply(Event::Exited(ExitKind::Failed(1)), now));
        assert_eq!(lc.apply(Event::ShutdownRequested, now), Some(Directive::Halt));
        assert_eq!(lc.state(), BackendState::Stopped);
    }

    #[test]
    fn operator_restart_skips_backoff() {
        let now = Instant::now();
        let mut lc = healthy(now);
        assert_eq!(lc.apply(Event::RestartRequested, now), Some(Directive::Terminate));
        assert_eq!(
            lc.apply(Event::Exited(ExitKind::Clean), now),
            Some(Directive::Spawn)
        );
        assert_eq!(lc.state(), BackendState::Starting);
        assert_eq!(lc.restart_count(), 1);

        // While a crash restart is pending, restart immediately.
        lc.apply(Event::Spawned { pid: 12 }, now);
        delay(lc.apply(Event::Exited(ExitKind::Failed(2)), now));
        assert_eq!(lc.apply(Event::RestartRequested, now), Some(Directive::Spawn));
        assert_eq!(lc.restart_count(), 2);
    }

    #[test]
    fn spawn_failure_backs_off() {
        let now = Instant::now();
        let mut lc = lifecycle();
        delay(lc.apply(Event::SpawnFailed, now));
        assert_eq!(lc.state(), BackendState::Crashed);
        assert_eq!(lc.apply(Event::RestartDue, now), Some(Directive::Spawn));
    }
}
