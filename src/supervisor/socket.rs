//! The activation socket shared with the backend.
//!
//! The proxy binds and listens on the socket before any backend process
//! exists. Connections arriving while the backend starts, restarts or
//! stalls wait in the listen backlog instead of being refused. The same
//! socket, at the same path, is handed to every backend incarnation.
//! If the path is unlinked from under the proxy, the next spawn binds a
//! fresh socket in its place.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use crate::supervisor::SupervisorError;

/// Mode for a socket directory created by the proxy.
const DIRECTORY_MODE: u32 = 0o750;

/// A bound, listening unix socket owned by the supervisor.
#[derive(Debug)]
pub struct ActivationSocket {
    path: PathBuf,
    mode: u32,
    backlog: u32,
    /// Device and inode of the socket file this listener was bound to.
    identity: (u64, u64),
    listener: UnixListener,
}

impl ActivationSocket {
    /// Bind `path` and start listening with `backlog`.
    ///
    /// A stale socket left by a previous run is removed. Any other kind of
    /// file at `path` is an error. Must be called within a Tokio runtime.
    pub fn bind(path: &Path, mode: u32, backlog: u32) -> Result<Self, SupervisorError> {
        let bind_err = |source: io::Error| SupervisorError::Bind {
            path: path.to_path_buf(),
            source,
        };

        ensure_parent(path).map_err(bind_err)?;
        remove_stale(path)?;

        let socket = tokio::net::UnixSocket::new_stream().map_err(bind_err)?;
        socket.bind(path).map_err(bind_err)?;
        // Restrict the file before anyone can connect.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(path).map_err(bind_err)?;
        let listener = socket.listen(backlog).map_err(bind_err)?;
        let listener = listener.into_std().map_err(bind_err)?;
        // The backend inherits this descriptor; hand it over in blocking mode.
        listener.set_nonblocking(false).map_err(bind_err)?;

        tracing::info!(path = %path.display(), backlog, mode = %format!("{mode:o}"), "Activation socket listening");
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            backlog,
            identity: (metadata.dev(), metadata.ino()),
            listener,
        })
    }

    /// Whether `path` still names the socket this listener is bound to.
    pub fn is_linked(&self) -> bool {
        std::fs::symlink_metadata(&self.path)
            .map(|m| (m.dev(), m.ino()) == self.identity)
            .unwrap_or(false)
    }

    /// Clear `O_NONBLOCK` on the listening description. Every backend shares
    /// it, and one that switched it would hand that mode to the next.
    pub fn restore_blocking(&self) -> io::Result<()> {
        self.listener.set_nonblocking(false)
    }

    /// Bind a new socket at the same path with the same mode and backlog.
    pub fn rebind(&self) -> Result<Self, SupervisorError> {
        Self::bind(&self.path, self.mode, self.backlog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting: unlink the path and close the proxy's descriptor.
    /// A path that now names some other file is left alone.
    pub fn close(self) {
        if !self.is_linked() {
            tracing::info!(path = %self.path.display(), "Activation socket closed, path already replaced");
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove activation socket");
            }
        }
        tracing::info!(path = %self.path.display(), "Activation socket closed");
    }
}

impl AsRawFd for ActivationSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    if parent.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)?;
    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(DIRECTORY_MODE))
}

fn remove_stale(path: &Path) -> Result<(), SupervisorError> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            std::fs::remove_file(path).map_err(|source| SupervisorError::Bind {
                path: path.to_path_buf(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "Removed stale socket file");
            Ok(())
        }
        Ok(_) => Err(SupervisorError::StalePath(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SupervisorError::Bind {
            path: path.to_path_buf(),
            source,
        }),
    }
}
