//! Backend supervision subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     socket.rs binds the activation socket (connections queue from here on)
//!     → process.rs spawns the backend with the socket as fd 3
//!
//! Runtime (single actor task):
//!     child exit ─┐
//!     commands ───┼→ state.rs (Lifecycle::apply) → Directive → process.rs
//!     restart timer┘
//!     → watch channel publishes BackendSnapshot
//!
//! Shutdown:
//!     unlink socket → SIGTERM leader → grace → SIGKILL group → Stopped
//! ```
//!
//! # Design Decisions
//! - All transitions serialized through one task: no racing restarts
//! - The socket outlives every backend incarnation; its path never changes
//! - Readers (router, monitor, admin) see state through a `watch` snapshot

pub mod process;
pub mod socket;
pub mod state;

use std::io;
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;

use crate::config::{BackendConfig, HealthCheckConfig, RestartConfig};
use crate::error::ProxyError;
use crate::observability::metrics;

pub use process::{BackendProcess, ExitKind};
pub use socket::ActivationSocket;
pub use state::{BackendState, Directive, Event, HealthPolicy, Lifecycle};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot bind activation socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} exists and is not a socket")]
    StalePath(PathBuf),

    #[error("cannot spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("supervisor is not running")]
    Closed,
}

/// Point-in-time view of the backend, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSnapshot {
    pub state: BackendState,
    pub pid: Option<u32>,
    pub socket_path: PathBuf,
    pub started_at: Option<SystemTime>,
    pub restart_count: u32,
    pub last_exit: Option<String>,
}

enum Command {
    Probe { pid: u32, ok: bool, consecutive_failures: u32 },
    Restart,
    Reconfigure { policy: HealthPolicy, restart: RestartConfig },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the supervisor task.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<BackendSnapshot>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Probe { pid, ok, .. } => write!(f, "Probe({pid}, {ok})"),
            Command::Restart => write!(f, "Restart"),
            Command::Reconfigure { .. } => write!(f, "Reconfigure"),
            Command::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

impl SupervisorHandle {
    pub fn snapshot(&self) -> BackendSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> BackendState {
        self.snapshot.borrow().state
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<BackendSnapshot> {
        self.snapshot.clone()
    }

    /// Report a probe outcome from the health monitor. `pid` is the process
    /// that was running when the check started.
    pub async fn report_probe(&self, pid: u32, ok: bool, consecutive_failures: u32) {
        let _ = self
            .commands
            .send(Command::Probe {
                pid,
                ok,
                consecutive_failures,
            })
            .await;
    }

    /// Stop the backend and start a new one without backoff.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.commands
            .send(Command::Restart)
            .await
            .map_err(|_| SupervisorError::Closed)
    }

    pub async fn reconfigure(&self, health: &HealthCheckConfig, restart: RestartConfig, restart_on_clean_exit: bool) {
        let policy = HealthPolicy::new(health, restart_on_clean_exit);
        let _ = self.commands.send(Command::Reconfigure { policy, restart }).await;
    }

    /// Tear down socket and process; resolves once the backend has stopped.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until the published state satisfies `pred`.
    pub async fn wait_for(&self, pred: impl Fn(&BackendSnapshot) -> bool) -> BackendSnapshot {
        let mut rx = self.snapshot.clone();
        let snapshot = match rx.wait_for(|s| pred(s)).await {
            Ok(snapshot) => snapshot.clone(),
            // Sender gone: the final snapshot is all there will be.
            Err(_) => self.snapshot(),
        };
        snapshot
    }
}

/// Supervisor actor. Owns the socket, the process and the state machine.
pub struct Supervisor {
    config: BackendConfig,
    socket: Option<ActivationSocket>,
    process: Option<BackendProcess>,
    lifecycle: Lifecycle,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<BackendSnapshot>,
    restart_at: Option<tokio::time::Instant>,
    kill_at: Option<tokio::time::Instant>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    commands_open: bool,
}

impl Supervisor {
    /// Bind the activation socket and start supervising the backend.
    ///
    /// The socket is listening when this returns, before the backend runs.
    pub fn start(
        backend: &BackendConfig,
        health: &HealthCheckConfig,
        restart: RestartConfig,
    ) -> Result<(SupervisorHandle, JoinHandle<()>), SupervisorError> {
        let socket = ActivationSocket::bind(&backend.socket_path, backend.socket_mode, backend.socket_backlog)?;
        let lifecycle = Lifecycle::new(HealthPolicy::new(health, backend.restart_on_clean_exit), restart);

        let initial = BackendSnapshot {
            state: lifecycle.state(),
            pid: None,
            socket_path: backend.socket_path.clone(),
            started_at: None,
            restart_count: 0,
            last_exit: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::channel(64);

        let supervisor = Self {
            config: backend.clone(),
            socket: Some(socket),
            process: None,
            lifecycle,
            commands: command_rx,
            snapshot: snapshot_tx,
            restart_at: None,
            kill_at: None,
            shutdown_waiters: Vec::new(),
            commands_open: true,
        };
        let task = tokio::spawn(supervisor.run());

        Ok((
            SupervisorHandle {
                commands: command_tx,
                snapshot: snapshot_rx,
            },
            task,
        ))
    }

    async fn run(mut self) {
        let first = self.lifecycle.start();
        let mut next = Some(first);
        self.publish();

        loop {
            while let Some(directive) = next.take() {
                next = self.execute(directive);
            }
            self.publish();
            if self.lifecycle.state() == BackendState::Stopped {
                break;
            }

            let event = tokio::select! {
                exit = wait_exit(&mut self.process) => {
                    self.kill_at = None;
                    if let Some(process) = self.process.take() {
                        // Reap workers the leader left behind.
                        if let Err(e) = process.kill_group() {
                            tracing::debug!(error = %e, "Group cleanup failed");
                        }
                    }
                    let kind = exit.unwrap_or_else(|e| {
                        tracing::error!(error = %e, "Failed to wait for backend");
                        ExitKind::Failed(-1)
                    });
                    if !kind.is_clean() {
                        tracing::warn!(error = %ProxyError::BackendCrashed(kind), "Backend process ended");
                    }
                    Event::Exited(kind)
                }
                _ = sleep_opt(self.restart_at) => {
                    self.restart_at = None;
                    Event::RestartDue
                }
                _ = sleep_opt(self.kill_at) => {
                    self.kill_at = None;
                    if let Some(process) = &self.process {
                        tracing::warn!(pid = process.pid(), "Grace period over, killing backend process group");
                        if let Err(e) = process.kill_group() {
                            tracing::error!(error = %e, "Failed to kill backend process group");
                        }
                    }
                    continue;
                }
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(Command::Probe { pid, ok: true, .. }) => Event::ProbeSucceeded { pid },
                    Some(Command::Probe { pid, ok: false, consecutive_failures }) => {
                        Event::ProbeFailed { pid, consecutive: consecutive_failures }
                    }
                    Some(Command::Restart) => {
                        tracing::info!("Operator requested backend restart");
                        Event::RestartRequested
                    }
                    Some(Command::Reconfigure { policy, restart }) => {
                        self.lifecycle.reconfigure(policy, restart);
                        tracing::info!("Supervisor policy updated");
                        continue;
                    }
                    Some(Command::Shutdown(done)) => {
                        self.shutdown_waiters.push(done);
                        self.close_socket();
                        Event::ShutdownRequested
                    }
                    // Every handle dropped.
                    None => {
                        self.commands_open = false;
                        self.close_socket();
                        Event::ShutdownRequested
                    }
                },
            };

            next = self.lifecycle.apply(event, Instant::now());
        }

        self.close_socket();
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::info!("Backend supervisor stopped");
    }

    /// Carry out one directive; may yield a follow-up directive.
    fn execute(&mut self, directive: Directive) -> Option<Directive> {
        let now = Instant::now();
        match directive {
            Directive::Spawn => {
                self.restart_at = None;
                if let Err(e) = self.relink_socket() {
                    tracing::error!(error = %e, "Cannot restore activation socket");
                    return self.lifecycle.apply(Event::SpawnFailed, now);
                }
                let Some(socket) = &self.socket else {
                    return self.lifecycle.apply(Event::SpawnFailed, now);
                };
                match BackendProcess::spawn(&self.config, socket) {
                    Ok(process) => {
                        let pid = process.pid();
                        self.process = Some(process);
                        if self.lifecycle.restart_count() > 0 {
                            metrics::record_backend_restart();
                        }
                        self.lifecycle.apply(Event::Spawned { pid }, now)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Backend spawn failed");
                        self.lifecycle.apply(Event::SpawnFailed, now)
                    }
                }
            }
            Directive::Terminate => {
                if let Some(process) = &self.process {
                    tracing::info!(pid = process.pid(), grace = ?self.config.shutdown_grace(), "Terminating backend");
                    if let Err(e) = process.terminate() {
                        tracing::error!(error = %e, "SIGTERM failed, killing group");
                        let _ = process.kill_group();
                    }
                    if self.kill_at.is_none() {
                        self.kill_at = Some(tokio::time::Instant::now() + self.config.shutdown_grace());
                    }
                }
                None
            }
            Directive::ScheduleRestart(delay) => {
                tracing::info!(delay = ?delay, attempt = self.lifecycle.restart_count() + 1, "Backend restart scheduled");
                self.restart_at = Some(tokio::time::Instant::now() + delay);
                None
            }
            Directive::Halt => {
                self.restart_at = None;
                None
            }
        }
    }

    /// Rebind the socket if its path no longer names our listener.
    fn relink_socket(&mut self) -> Result<(), SupervisorError> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        if socket.is_linked() {
            return Ok(());
        }
        tracing::warn!(path = %socket.path().display(), "Activation socket path was removed, binding a new socket");
        let fresh = socket.rebind()?;
        // The old listener is dropped without touching the path.
        self.socket = Some(fresh);
        Ok(())
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }

    fn publish(&self) {
        let snapshot = BackendSnapshot {
            state: self.lifecycle.state(),
            pid: self.lifecycle.pid(),
            socket_path: self.config.socket_path.clone(),
            started_at: self.process.as_ref().map(BackendProcess::started_wall),
            restart_count: self.lifecycle.restart_count(),
            last_exit: self.lifecycle.last_exit().map(|e| e.to_string()),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            if current.state != snapshot.state {
                metrics::record_backend_state(snapshot.state);
            }
            *current = snapshot;
            true
        });
    }
}

async fn wait_exit(process: &mut Option<BackendProcess>) -> io::Result<ExitKind> {
    match process {
        Some(process) => process.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell_config(dir: &std::path::Path, script: &str) -> BackendConfig {
        BackendConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            socket_path: dir.join("backend.sock"),
            shutdown_grace_secs: 1,
            ..BackendConfig::default()
        }
    }

    fn fast_restart() -> RestartConfig {
        RestartConfig {
            base_delay_ms: 50,
            max_delay_ms: 200,
            multiplier: 2.0,
            healthy_reset_secs: 60,
        }
    }

    #[tokio::test]
    async fn crashing_backend_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell_config(dir.path(), "sleep 0.1; exit 3");
        let (handle, task) = Supervisor::start(&config, &HealthCheckConfig::default(), fast_restart()).unwrap();

        let snapshot = tokio::time::timeout(
            Duration::from_secs(10),
            handle.wait_for(|s| s.restart_count >= 2),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.socket_path, config.socket_path);

        handle.shutdown().await;
        task.await.unwrap();
        assert_eq!(handle.state(), BackendState::Stopped);
        assert!(!config.socket_path.exists());
    }

    #[tokio::test]
    async fn clean_exit_stops_supervision() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell_config(dir.path(), "exit 0");
        let (handle, task) = Supervisor::start(&config, &HealthCheckConfig::default(), fast_restart()).unwrap();

        tokio::time::timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, BackendState::Stopped);
        assert_eq!(snapshot.last_exit.as_deref(), Some("exited cleanly"));
    }

    #[tokio::test]
    async fn restart_restores_removed_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell_config(dir.path(), "exec sleep 30");
        let (handle, task) = Supervisor::start(&config, &HealthCheckConfig::default(), fast_restart()).unwrap();
        let first = handle.wait_for(|s| s.pid.is_some()).await.pid;

        std::fs::remove_file(&config.socket_path).unwrap();
        handle.restart().await.unwrap();
        let next = tokio::time::timeout(
            Duration::from_secs(10),
            handle.wait_for(|s| s.pid.is_some() && s.pid != first),
        )
        .await
        .unwrap();
        assert_eq!(next.restart_count, 1);
        assert!(std::os::unix::net::UnixStream::connect(&config.socket_path).is_ok());

        handle.shutdown().await;
        task.await.unwrap();
        assert!(!config.socket_path.exists());
    }

    #[tokio::test]
    async fn shutdown_kills_backend_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell_config(dir.path(), "trap '' TERM; while true; do sleep 0.1; done");
        let (handle, task) = Supervisor::start(&config, &HealthCheckConfig::default(), fast_restart()).unwrap();
        let running = handle.wait_for(|s| s.pid.is_some()).await;
        let pid = running.pid.unwrap();

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(10), handle.shutdown()).await.unwrap();
        task.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));

        // SAFETY: probing with signal 0 has no effect.
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        assert!(!alive);
    }
}
