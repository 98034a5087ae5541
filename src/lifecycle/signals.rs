//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//! - Trigger appropriate actions (shutdown, reload)
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT during shutdown asks for a forced exit
//! - SIGHUP triggers config reload, not shutdown

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use crate::lifecycle::reload::Reloader;
use crate::lifecycle::shutdown::Shutdown;

/// Handle signals until a second termination signal arrives.
///
/// The first SIGTERM or SIGINT triggers graceful shutdown. Returning means
/// the operator wants the process gone now.
pub async fn handle_signals(shutdown: Arc<Shutdown>, reloader: Arc<Reloader>) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sighup.recv() => {
                match reloader.reload_from_disk().await {
                    Ok(report) => tracing::info!(
                        applied = ?report.applied,
                        restart_required = ?report.restart_required,
                        "SIGHUP reload complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "SIGHUP reload rejected, keeping current configuration"),
                }
                continue;
            }
        };

        if shutdown.trigger() {
            tracing::info!(signal = name, "Shutdown signal received, draining");
        } else {
            tracing::warn!(signal = name, "Second shutdown signal, forcing exit");
            return Ok(());
        }
    }
}
