//! Backend process spawning and signalling.
//!
//! The backend runs in its own process group with the activation socket as
//! fd 3 and the systemd socket-activation variables set, so any server that
//! understands `LISTEN_FDS` (or `--bind fd://3`) can serve on it.

use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Instant, SystemTime};

use tokio::process::{Child, Command};

use crate::config::BackendConfig;
use crate::supervisor::socket::ActivationSocket;
use crate::supervisor::SupervisorError;

/// First descriptor number in the socket-activation protocol.
const LISTEN_FDS_START: i32 = 3;

/// Sets `LISTEN_PID` to the exec'd process's own pid, which is unknown
/// before fork.
const LISTEN_PID_WRAPPER: &str = r#"export LISTEN_PID=$$; exec "$0" "$@""#;

/// How a backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit status 0: an intentional stop.
    Clean,
    /// Non-zero exit status: an internal fatal error.
    Failed(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl ExitKind {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitKind::Clean,
            (Some(code), _) => ExitKind::Failed(code),
            (None, Some(signal)) => ExitKind::Signaled(signal),
            (None, None) => ExitKind::Failed(-1),
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitKind::Clean)
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Clean => write!(f, "exited cleanly"),
            ExitKind::Failed(code) => write!(f, "exited with status {code}"),
            ExitKind::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// A running backend process group.
#[derive(Debug)]
pub struct BackendProcess {
    child: Child,
    pid: u32,
    started_at: Instant,
    started_wall: SystemTime,
}

impl BackendProcess {
    /// Spawn the backend with `socket` passed as fd 3.
    pub fn spawn(config: &BackendConfig, socket: &ActivationSocket) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(LISTEN_PID_WRAPPER)
            .arg(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .env("LISTEN_FDS", "1")
            .env("LISTEN_FDNAMES", "backend")
            .env_remove("LISTEN_PID")
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let spawn_err = |source: io::Error| SupervisorError::Spawn {
            command: config.command.clone(),
            source,
        };
        socket.restore_blocking().map_err(spawn_err)?;

        let fd = socket.as_raw_fd();
        // SAFETY: the closure runs between fork and exec and only calls
        // async-signal-safe functions (fcntl, dup2).
        unsafe {
            cmd.pre_exec(move || {
                if fd == LISTEN_FDS_START {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags == -1
                        || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1
                    {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, LISTEN_FDS_START) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(spawn_err)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err(io::Error::other("process exited before its pid was read")))?;

        tracing::info!(pid, command = %config.command, "Backend process spawned");
        Ok(Self {
            child,
            pid,
            started_at: Instant::now(),
            started_wall: SystemTime::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn started_wall(&self) -> SystemTime {
        self.started_wall
    }

    /// Wait for the group leader to exit.
    pub async fn wait(&mut self) -> io::Result<ExitKind> {
        let status = self.child.wait().await?;
        Ok(ExitKind::from_status(status))
    }

    /// Ask the group leader to stop gracefully.
    pub fn terminate(&self) -> Result<(), SupervisorError> {
        self.signal(self.pid as libc::pid_t, libc::SIGTERM)
    }

    /// Kill every process in the group.
    pub fn kill_group(&self) -> Result<(), SupervisorError> {
        self.signal(-(self.pid as libc::pid_t), libc::SIGKILL)
    }

    fn signal(&self, target: libc::pid_t, signal: libc::c_int) -> Result<(), SupervisorError> {
        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(target, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone.
            return Ok(());
        }
        Err(SupervisorError::Signal {
            pid: self.pid,
            source: err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn shell_backend(script: &str) -> BackendConfig {
        BackendConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn exit_kinds() {
        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(0)), ExitKind::Clean);
        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(3 << 8)), ExitKind::Failed(3));
        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(9)), ExitKind::Signaled(9));
    }

    #[tokio::test]
    async fn passes_socket_activation_environment() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ActivationSocket::bind(&dir.path().join("b.sock"), 0o600, 8).unwrap();
        let out = dir.path().join("env.txt");

        let script = format!(
            r#"echo "$LISTEN_FDS $LISTEN_FDNAMES $LISTEN_PID $$" > {}; [ -S /proc/self/fd/3 ] || test -e /dev/fd/3"#,
            out.display()
        );
        let mut process = BackendProcess::spawn(&shell_backend(&script), &socket).unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit, ExitKind::Clean);

        let line = std::fs::read_to_string(&out).unwrap();
        let fields: Vec<_> = line.split_whitespace().collect();
        assert_eq!(fields[0], "1");
        assert_eq!(fields[1], "backend");
        assert_eq!(fields[2], fields[3], "LISTEN_PID must be the backend's own pid");
        assert_eq!(fields[2], process.pid().to_string());
        socket.close();
    }

    #[tokio::test]
    async fn sigterm_then_group_kill() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ActivationSocket::bind(&dir.path().join("b.sock"), 0o600, 8).unwrap();

        let mut process =
            BackendProcess::spawn(&shell_backend("trap '' TERM; while true; do sleep 1; done"), &socket)
                .unwrap();
        process.terminate().unwrap();
        let still_running =
            tokio::time::timeout(std::time::Duration::from_millis(300), process.wait()).await;
        assert!(still_running.is_err(), "TERM is ignored by the script");

        process.kill_group().unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit, ExitKind::Signaled(libc::SIGKILL));
        socket.close();
    }

    #[tokio::test]
    async fn missing_command_fails_at_exec() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ActivationSocket::bind(&dir.path().join("b.sock"), 0o600, 8).unwrap();
        let config = BackendConfig {
            command: "/nonexistent/backend".to_string(),
            args: vec![],
            ..BackendConfig::default()
        };

        // The shell wrapper starts, then its exec fails with 127.
        let mut process = BackendProcess::spawn(&config, &socket).unwrap();
        assert_eq!(process.wait().await.unwrap(), ExitKind::Failed(127));
        socket.close();
    }
}
