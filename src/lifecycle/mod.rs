//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Load TLS → Bind backend socket, spawn backend
//!     → Bind router → Health monitor, sweeper, watcher → Admin API
//!
//! Reload (reload.rs):
//!     SIGHUP / POST /reload / file change → validate → swap snapshots
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections
//!     → Unlink socket → SIGTERM backend → grace → SIGKILL group
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then the backend socket, then listeners
//! - Ordered shutdown: stop accept, drain, stop backend
//! - Shutdown has timeout: forced exit after deadline

pub mod reload;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use reload::{ReloadReport, Reloader};
pub use shutdown::Shutdown;
pub use startup::Gateway;
